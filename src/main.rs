use anyhow::Result;
use std::sync::Arc;

use stationlink::{
    boot,
    cli::{self, actions},
    protocol::transport::WireTransportFactory,
};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli::parse_args();
    boot::init_logger(matches.get_one::<String>("log-file").map(String::as_str));

    let config = actions::load_config(&matches)?;
    let json = matches.get_flag("json");

    if matches.get_flag("check") {
        return actions::print_check(&config, json);
    }
    if matches.get_flag("probe") {
        let reports = tokio::task::spawn_blocking(move || {
            actions::probe_stations(&config, Arc::new(WireTransportFactory))
        })
        .await?;
        return actions::print_probe(&reports, json);
    }

    actions::run_daemon(config).await
}
