pub mod progress;
pub mod summary;

pub use progress::epoch_bar;
pub use summary::SummaryWriter;
