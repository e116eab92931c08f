// Copyright 2024 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use caravel_common::tracing::init_tracing_with_default_env_filter;
use caravel_server::bootstrap::Server;
use caravel_server::config::make_config_loader;
use caravel_server::metrics;
use tracing::{error, info};

fn main() -> Result<(), std::io::Error> {
    if let Some(config) = make_config_loader().load_or_dump_config() {
        if let Err(err) = config.validate() {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(1);
        }
        init_tracing_with_default_env_filter(&config.tracing);
        let _registry = metrics::register_all();

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(async_main(config))
    } else {
        Ok(())
    }
}

async fn async_main(config: caravel_server::config::ServerConfig) -> Result<(), std::io::Error> {
    let server = Server::start(config).await.map_err(|err| {
        error!("Server failed to start: {err:#}");
        std::io::Error::other(err)
    })?;

    info!("Server core v{} running, waiting for shutdown", caravel_server::VERSION);
    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}
