use crate::{common::*, message::LogMessage, metrics::MetricsReport, utils};
use tfrecord::EventWriterInit;

/// Writes TensorBoard events received from the rank 0 worker.
pub async fn logging_worker(
    event_dir: impl AsRef<Path>,
    mut log_rx: mpsc::Receiver<LogMessage>,
) -> Result<()> {
    let event_dir = event_dir.as_ref();
    tokio::fs::create_dir_all(event_dir).await?;

    let mut event_writer = {
        let event_path_prefix = event_dir
            .join("mask-inpaint")
            .into_os_string()
            .into_string()
            .map_err(|path| format_err!("'{:?}' is not a valid UTF-8 path", path))?;

        EventWriterInit::default()
            .from_prefix_async(event_path_prefix, None)
            .await?
    };

    while let Some(msg) = log_rx.recv().await {
        match msg {
            LogMessage::Losses {
                step,
                losses,
                learning_rate_g,
                learning_rate_d,
                loss_scale,
            } => {
                let step = step as i64;

                for (name, value) in losses {
                    event_writer
                        .write_scalar_async(format!("loss/{}", name), step, value as f32)
                        .await?;
                }

                event_writer
                    .write_scalar_async("params/learning_rate_g", step, learning_rate_g as f32)
                    .await?;
                event_writer
                    .write_scalar_async("params/learning_rate_d", step, learning_rate_d as f32)
                    .await?;
                event_writer
                    .write_scalar_async("params/loss_scale", step, loss_scale as f32)
                    .await?;
            }
            LogMessage::Metrics { step, report } => {
                let step = step as i64;
                let MetricsReport {
                    accuracy,
                    quality,
                    ..
                } = report;

                event_writer
                    .write_scalar_async("metrics/accuracy", step, accuracy as f32)
                    .await?;

                if let Some(quality) = quality {
                    event_writer
                        .write_scalar_async("metrics/ssim", step, quality.ssim as f32)
                        .await?;
                    event_writer
                        .write_scalar_async("metrics/psnr", step, quality.psnr as f32)
                        .await?;
                    event_writer
                        .write_scalar_async("metrics/lpips", step, quality.lpips as f32)
                        .await?;
                }
            }
            LogMessage::Images {
                step,
                original,
                coarse,
                recon,
            } => {
                let step = step as i64;

                for (tag, images) in [("original", original), ("coarse", coarse), ("recon", recon)]
                {
                    let images: Vec<_> = (0..images.size()[0])
                        .map(|index| utils::to_byte_image(&images.get(index)))
                        .collect();
                    event_writer
                        .write_image_list_async(format!("image/{}", tag), step, images)
                        .await?;
                }
            }
        }
    }

    Ok(())
}
