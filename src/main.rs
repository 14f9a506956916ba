/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Parser};
use flexi_logger::{
    colored_opt_format, Age, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming,
};
use log::info;

use ::pyunwind_agent::{config::Config, sampler::Sampler};

const DEFAULT_LOG_RETENTION: usize = 7;

#[derive(Parser)]
struct Opts {
    /// Specify config file location
    #[clap(short = 'f', long, default_value = "/etc/pyunwind-agent.yaml")]
    config_file: String,

    /// Display the version
    #[clap(short, long, action = ArgAction::SetTrue)]
    version: bool,

    /// Override the pid in the config file
    #[clap(short, long)]
    pid: Option<u32>,
}

fn start_logger(config: &Config) -> Result<LoggerHandle> {
    let logger = Logger::try_with_env_or_str(&config.log_level)?.format(colored_opt_format);
    let logger = if config.log_file.is_empty() {
        logger.log_to_stderr()
    } else {
        logger
            .log_to_file(FileSpec::try_from(&config.log_file)?)
            .rotate(
                Criterion::Age(Age::Day),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(DEFAULT_LOG_RETENTION),
            )
            .append()
            .duplicate_to_stderr(Duplicate::Warn)
    };
    Ok(logger.start()?)
}

#[cfg(unix)]
fn register_signals(terminated: &Arc<AtomicBool>) -> Result<()> {
    use signal_hook::{consts::TERM_SIGNALS, flag};

    for sig in TERM_SIGNALS {
        flag::register(*sig, Arc::clone(terminated))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn register_signals(_: &Arc<AtomicBool>) -> Result<()> {
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    if opts.version {
        println!("pyunwind-agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = Config::load_from_file(&opts.config_file)?;
    if let Some(pid) = opts.pid {
        config.pid = pid;
    }
    config.check()?;
    let _logger = start_logger(&config)?;
    info!("sampling process#{} every {:?}", config.pid, config.sample_interval);

    let terminated = Arc::new(AtomicBool::new(false));
    register_signals(&terminated)?;

    let mut sampler = Sampler::new(config)?;
    sampler.run(&terminated);
    sampler.report(io::stdout().lock())?;

    Ok(())
}
