pub mod exif;
pub mod hash;
pub mod organizer;
pub mod paths;
pub mod scanner;

pub use exif::{CaptureProbe, ExifToolProbe};
pub use hash::{Fingerprint, Hasher};
pub use organizer::Organizer;
pub use scanner::{MediaGroup, MediaScanner, ScanOutcome};
