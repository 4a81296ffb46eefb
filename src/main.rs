use anyhow::{anyhow, Context};
use laurel_pos::{logging, Config, Role};

const ENV_ROLE: &str = "LAUREL_ROLE";

fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    let _log_guard = logging::init_logging(&config).context("failed to initialise logging")?;

    let role = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(ENV_ROLE).ok())
        .filter(|r| !r.trim().is_empty())
        .map(|r| r.parse::<Role>().map_err(|e| anyhow!(e)))
        .transpose()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(laurel_pos::run(config, role))
}
