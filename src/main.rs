#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use sipturn::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.turn.username.is_none() {
        log::warn!("No turn credentials are configured, the server may refuse the allocation");
    }

    sipturn::startup(config).await
}
