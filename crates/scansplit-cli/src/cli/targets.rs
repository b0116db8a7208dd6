use super::config::RunConfig;
use anyhow::{Context, bail};
use scansplit::Target;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};
use tokio_stream::{StreamExt, wrappers::LinesStream};

/// Collects the inline targets followed by those read from the targets file.
pub async fn load_targets(config: &RunConfig) -> anyhow::Result<Vec<Target>> {
    let mut targets = config.targets.clone();

    if let Some(path) = &config.targets_file {
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open targets file {}", path.display()))?;
        let mut lines = LinesStream::new(BufReader::new(file).lines());

        while let Some(line) = lines.next().await {
            let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            targets.push(line.to_owned());
        }
    }

    if targets.is_empty() {
        bail!("Target list is empty");
    }
    Ok(targets)
}
