mod progress;

pub use progress::{ProgressBar, ProgressDrawMode, ProgressSpeed};
pub use progress::format::{BinarySize, HumanDuration};
