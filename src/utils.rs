use crate::common::*;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RateCounter {
    window: Duration,
    count: f64,
    since: Instant,
    last_rate: Option<f64>,
}

impl RateCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            count: 0.0,
            since: Instant::now(),
            last_rate: None,
        }
    }

    pub fn with_second_interval() -> Self {
        Self::new(Duration::from_secs(1))
    }

    pub fn add(&mut self, count: f64) {
        self.count += count;

        let elapsed = self.since.elapsed();
        if elapsed >= self.window {
            self.last_rate = Some(self.count / elapsed.as_secs_f64());
            self.count = 0.0;
            self.since = Instant::now();
        }
    }

    pub fn rate(&self) -> Option<f64> {
        self.last_rate
    }
}

/// Converts a `[3, H, W]` image in `[-1, 1]` to a byte image on CPU.
pub fn to_byte_image(image: &Tensor) -> Tensor {
    ((image.detach().to_device(Device::Cpu) + 1.0) * 127.5)
        .clamp(0.0, 255.0)
        .to_kind(Kind::Uint8)
}

pub fn save_image(image: &Tensor, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    tch::vision::image::save(&to_byte_image(image), path)
        .with_context(|| format!("unable to save image '{}'", path.display()))?;
    Ok(())
}
