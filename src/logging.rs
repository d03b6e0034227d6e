/// Startup summary printed once before the first window.
#[derive(Debug, Clone)]
pub struct RunBanner {
    pub num_examples: usize,
    pub num_epochs: usize,
    pub per_device_batch_size: usize,
    pub accumulation_steps: usize,
    pub total_batch_size: usize,
    pub max_steps: usize,
    pub trainable_parameters: usize,
}

/// Plain progress stream: `(step, loss)` lines on stdout, warnings on stderr.
/// Everything is gated on `enable_stdout` so tests run quietly.
pub struct Logger {
    enable_stdout: bool,
}

impl Logger {
    pub fn new(enable_stdout: bool) -> Self {
        Self { enable_stdout }
    }

    pub fn banner(&self, banner: &RunBanner) {
        if !self.enable_stdout {
            return;
        }
        println!(
            "num_examples={} num_epochs={} batch_size_per_device={}",
            banner.num_examples, banner.num_epochs, banner.per_device_batch_size
        );
        println!(
            "gradient_accumulation_steps={} total_batch_size={} total_steps={}",
            banner.accumulation_steps, banner.total_batch_size, banner.max_steps
        );
        println!("trainable_parameters={}", banner.trainable_parameters);
    }

    /// One `(step, loss)` tuple on the progress stream.
    pub fn log_step(&self, step: usize, loss: f64) {
        if self.enable_stdout {
            println!("{}, {:.4}", step, loss);
        }
    }

    pub fn info(&self, message: &str) {
        if self.enable_stdout {
            println!("{message}");
        }
    }

    pub fn warn(&self, message: &str) {
        eprintln!("warning: {message}");
    }
}
