use std::path::Path;

use medx_media::{check_ffmpeg, check_ytdlp, ExtractorConfig};
use medx_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env();
    let extractor = ExtractorConfig::from_env();

    println!(
        "medx-selfcheck: starting with work_dir={}",
        config.work_dir.display()
    );
    ensure_workdir(&config.work_dir).await?;

    let ytdlp = check_ytdlp(&extractor.ytdlp_path)?;
    println!("medx-selfcheck: yt-dlp at {}", ytdlp.display());
    let ffmpeg = check_ffmpeg(&extractor.ffmpeg_path)?;
    println!("medx-selfcheck: ffmpeg at {}", ffmpeg.display());

    ensure_env_present(&["REDIS_URL"])?;

    println!("medx-selfcheck: ok");
    Ok(())
}

async fn ensure_workdir(path: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(path).await?;
    let probe = path.join(".selfcheck");
    tokio::fs::write(&probe, b"ok")
        .await
        .map_err(|e| anyhow::anyhow!("work dir {} not writable: {}", path.display(), e))?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}

fn ensure_env_present(vars: &[&str]) -> anyhow::Result<()> {
    for var in vars {
        if std::env::var(var).is_err() {
            return Err(anyhow::anyhow!("missing required env var {}", var));
        }
    }
    Ok(())
}
