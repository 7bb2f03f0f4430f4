use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use log::{debug, error};

use gdbgrab::cli::{Cli, Config};
use gdbgrab::conn::TcpTransport;
use gdbgrab::session::Session;
use gdbgrab::target::TargetLog;
use gdbgrab::{interactive, logger, priority, script};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{}", message);
            return ExitCode::FAILURE;
        }
    };

    logger::init(config.log_file.as_deref(), config.debug);

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            if logger::logging_to_file() {
                println!(
                    "An error occurred during the transfer of data from the embedded system.\n\
                     The log file contains further details."
                );
            }
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> gdbgrab::Result<()> {
    let started = Instant::now();

    let transport = TcpTransport::connect(config.ip, config.port)?;
    let session = Session::establish(transport, config.max_message_size)?;
    let mut log = TargetLog::new(session, config);

    priority::increase(log.config());
    let result = run_session(&mut log, started);
    priority::decrease(log.config());

    if log.config().detach {
        log.session_mut().detach();
    }
    result
}

fn run_session(log: &mut TargetLog<TcpTransport>, started: Instant) -> gdbgrab::Result<()> {
    if let Some(script_path) = log.config().start_script.clone() {
        log.run_script(&script_path)?;
    }

    if log.config().persistent {
        interactive::run(log)?;
    } else {
        println!("Reading from embedded system ...");
        log.snapshot()?;
        debug!("Total time: {} ms", started.elapsed().as_millis());

        if let Some(decode) = log.config().decode_file.clone() {
            script::run_batch_file(&decode);
        }
    }
    Ok(())
}
