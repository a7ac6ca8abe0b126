use indicatif::{ProgressBar, ProgressStyle};

/// Per-epoch batch progress bar.
pub fn epoch_bar(epoch: usize, epochs: usize, total_batches: usize) -> ProgressBar {
    let pb = ProgressBar::new(total_batches as u64);
    let style = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(format!("epoch {}/{}", epoch + 1, epochs));
    pb
}
