pub mod controller;
pub mod feedback;
pub mod saver;
pub mod settings;
pub mod transport;

pub use controller::{SelectedFile, TransferController};
pub use feedback::{ClipboardWriter, FeedbackSequencer, SystemClipboard};
pub use saver::{DirectorySaver, PayloadSaver};
pub use transport::{HttpTransport, Transport};
