use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use rtubms_lib::protection;
use rtubms_lib::serial_hal::SerialHal;
use rtubms_lib::{FrameReceiver, Slave};
use std::{ops::Deref, panic, sync::Arc};

mod commandline;
mod daemon;
mod mqtt;
mod settings;
mod simulator;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn open_master(args: &CliArgs) -> Result<rtubms_lib::serialport::RtuMaster> {
    let mut master = rtubms_lib::serialport::RtuMaster::new(&args.device)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    master.set_timeout(args.timeout)?;
    master.set_delay(args.delay);
    master.set_retry(args.retries);
    Ok(master)
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    match &args.command {
        CliCommands::Serve {
            config,
            address,
            interval,
            rts_direction,
            seed,
        } => {
            let settings = match config {
                Some(path) => settings::Settings::load(path)?,
                None => settings::Settings::default(),
            };
            let mut slave_config = settings.into_slave_config();
            if let Some(address) = address {
                slave_config.slave_address = *address;
            }
            if let Some(interval) = interval {
                slave_config.poll_interval = *interval;
            }
            if slave_config.conversion.cell_divider <= 1 {
                warn!("No cell divider configured, simulated cells read at most the ADC reference");
            }
            info!("Slave configuration: {slave_config:?}");

            let receiver = Arc::new(FrameReceiver::new(slave_config.slave_address));
            let pack = simulator::SimulatedPack::new(slave_config.conversion, *seed);
            let hal = SerialHal::open(&args.device, receiver.clone(), pack, *rts_direction)
                .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
            Slave::new(slave_config, hal, &receiver).run()
        }
        CliCommands::Read { address } => {
            let mut master = open_master(&args)?;
            let samples = master
                .get_samples(*address)
                .with_context(|| format!("Cannot read input registers of slave {address:02X}"))?;
            println!("Cell voltages: {:?} mV", samples.cell_voltages);
            println!("Current: {} mA", samples.current);
            println!("Temperatures: {:?} °C", samples.temperatures);
            match protection::check(&samples, &protection::Thresholds::default(), true) {
                Some(cause) => println!("Protection: Fault ({cause})"),
                None => println!("Protection: Normal"),
            }
        }
        CliCommands::Daemon {
            output,
            address,
            interval,
        } => {
            let master = open_master(&args)?;
            daemon::run(master, *address, output.clone(), *interval)?;
        }
    }

    Ok(())
}
