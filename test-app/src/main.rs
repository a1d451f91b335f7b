// dtmlib test application -- CLI tool for running Bluetooth LE Direct Test
// Mode sessions against a serial DTM device or a scripted mock transport.
//
// Usage:
//   dtmlib-test-app --port /dev/ttyACM0 reset
//   dtmlib-test-app --port /dev/ttyACM0 features
//   dtmlib-test-app --port /dev/ttyACM0 max rx-octets
//   dtmlib-test-app --port /dev/ttyACM0 --tx-power=-4 tx --channel 19 --timeout-ms 5000
//   dtmlib-test-app --port /dev/ttyACM0 --phy 2m rx --channel 19
//   dtmlib-test-app --port /dev/ttyACM0 sweep-rx --low 0 --high 39 --sweep-ms 250 --timeout-ms 20000
//   dtmlib-test-app --mock sweep-tx --low 10 --high 12 --sweep-ms 100 --timeout-ms 1000
//
// A timeout of 0 keeps the test running until Ctrl-C.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dtmlib::codec::{self, Report, Response, SetupControl};
use dtmlib::{DtmBuilder, Sweep, TestConfiguration, TestController, TestOutcome};
use dtmlib_core::{
    Channel, DtmEvent, MAX_CHANNEL, ModulationIndex, PacketType, Phy, SupportedParameter,
};
use dtmlib_test_harness::MockTransport;
use dtmlib_transport::DTM_BAUD_RATE;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// dtmlib test application -- runs DTM tests from the command line.
#[derive(Parser)]
#[command(name = "dtmlib-test-app", version, about)]
struct Cli {
    /// Serial port path (e.g. /dev/ttyACM0, COM3).
    /// Required unless --mock is used.
    #[arg(long)]
    port: Option<String>,

    /// Override the DTM baud rate.
    #[arg(long, default_value_t = DTM_BAUD_RATE)]
    baud: u32,

    /// Response window per command, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    response_timeout_ms: u64,

    /// Payload length in octets for transmitter tests.
    #[arg(long, default_value_t = 1)]
    length: u8,

    /// PHY: 1m, 2m, s8, s2.
    #[arg(long, default_value = "1m")]
    phy: Phy,

    /// Modulation index: standard, stable.
    #[arg(long, default_value = "standard")]
    modulation: ModulationIndex,

    /// Transmit power in dBm.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    tx_power: i8,

    /// Vendor timer selection.
    #[arg(long, default_value_t = 0)]
    timer: u8,

    /// Use a scripted mock transport instead of a real serial port.
    /// Useful for verifying CLI parsing and controller wiring without
    /// hardware.
    #[arg(long)]
    mock: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    /// RUST_LOG takes precedence when set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send LE Test Setup reset.
    Reset,

    /// Read the supported features.
    Features,

    /// Read a supported maximum: tx-octets, tx-time, rx-octets, rx-time.
    Max { parameter: SupportedParameter },

    /// Transmit on a single channel.
    Tx {
        #[arg(long, value_parser = channel_parser())]
        channel: u8,

        /// Bit pattern: prbs9, 11110000, 10101010, constant.
        #[arg(long, default_value = "prbs9")]
        pattern: PacketType,

        /// Stop after this many milliseconds (0 = until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        timeout_ms: u64,
    },

    /// Receive on a single channel and count packets.
    Rx {
        #[arg(long, value_parser = channel_parser())]
        channel: u8,

        /// Stop after this many milliseconds (0 = until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        timeout_ms: u64,
    },

    /// Transmit across a channel range.
    SweepTx {
        #[command(flatten)]
        sweep: SweepArgs,

        /// Bit pattern: prbs9, 11110000, 10101010, constant.
        #[arg(long, default_value = "prbs9")]
        pattern: PacketType,
    },

    /// Receive across a channel range and count packets per channel.
    SweepRx {
        #[command(flatten)]
        sweep: SweepArgs,
    },
}

#[derive(Args)]
struct SweepArgs {
    /// Lowest channel of the sweep.
    #[arg(long, default_value_t = 0, value_parser = channel_parser())]
    low: u8,

    /// Highest channel of the sweep.
    #[arg(long, default_value_t = MAX_CHANNEL, value_parser = channel_parser())]
    high: u8,

    /// Dwell time per channel in milliseconds.
    #[arg(long, default_value_t = 1000)]
    sweep_ms: u64,

    /// Stop the sweep after this many milliseconds (0 = until Ctrl-C).
    #[arg(long, default_value_t = 0)]
    timeout_ms: u64,

    /// Visit channels in random order.
    #[arg(long)]
    random: bool,
}

impl SweepArgs {
    fn sweep(&self) -> Sweep {
        Sweep::new(self.low, self.high)
            .sweep_time(Duration::from_millis(self.sweep_ms))
            .timeout(Duration::from_millis(self.timeout_ms))
            .random(self.random)
    }
}

fn channel_parser() -> clap::builder::RangedI64ValueParser<u8> {
    clap::value_parser!(u8).range(0..=MAX_CHANNEL as i64)
}

impl Cli {
    fn configuration(&self) -> TestConfiguration {
        TestConfiguration {
            length: self.length,
            phy: self.phy,
            modulation: self.modulation,
            tx_power_dbm: self.tx_power,
            timer: self.timer,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller construction
// ---------------------------------------------------------------------------

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn connect(cli: &Cli) -> Result<TestController> {
    let builder = DtmBuilder::new()
        .baud_rate(cli.baud)
        .response_timeout(Duration::from_millis(cli.response_timeout_ms))
        .configuration(cli.configuration());

    if cli.mock {
        let mock = MockTransport::new();
        script_mock(&mock, &cli.command, &cli.configuration())?;
        let dtm = builder
            .build_with_transport(Box::new(mock))
            .await
            .context("failed to build controller with mock transport")?;
        println!("Connected (mock transport)");
        return Ok(dtm);
    }

    let port = cli
        .port
        .as_deref()
        .context("--port is required when not using --mock")?;
    let dtm = builder
        .serial_port(port)
        .build()
        .await
        .with_context(|| format!("failed to set up DTM session on {port}"))?;
    println!("Using {port} at {} baud", cli.baud);
    Ok(dtm)
}

// ---------------------------------------------------------------------------
// Mock scripting
// ---------------------------------------------------------------------------

const STATUS_OK: [u8; 2] = [0x00, 0x00];

fn packet_report(packets: u16) -> [u8; 2] {
    [0x80 | ((packets >> 8) as u8 & 0x3F), packets as u8]
}

fn setup(control: SetupControl, parameter: u8) -> [u8; 2] {
    codec::encode_setup(control, parameter, 0).to_bytes()
}

fn script_setup(mock: &MockTransport, config: &TestConfiguration, transmitter: bool) {
    mock.expect(&setup(SetupControl::Reset, 0), &STATUS_OK);
    mock.expect(&codec::encode_select_timer(config.timer).to_bytes(), &STATUS_OK);
    if transmitter {
        mock.expect(&codec::encode_tx_power(config.tx_power_dbm).to_bytes(), &STATUS_OK);
        mock.expect(&setup(SetupControl::EnableLength, config.length >> 6), &STATUS_OK);
    }
    mock.expect(
        &setup(SetupControl::SetModulation, config.modulation.wire_value()),
        &STATUS_OK,
    );
    mock.expect(&setup(SetupControl::SetPhy, config.phy.wire_value()), &STATUS_OK);
}

/// Number of sweep steps to script: enough for the whole timeout.
fn mock_sweep_steps(sweep: &SweepArgs) -> Result<usize> {
    if sweep.random {
        bail!("--mock sweeps need sequential channel order");
    }
    if sweep.timeout_ms == 0 || sweep.sweep_ms == 0 {
        bail!("--mock sweeps need non-zero --sweep-ms and --timeout-ms");
    }
    Ok((sweep.timeout_ms / sweep.sweep_ms) as usize + 2)
}

/// Load the exchanges a well-behaved device would answer for `command`.
fn script_mock(mock: &MockTransport, command: &Command, config: &TestConfiguration) -> Result<()> {
    let end = codec::encode_end().to_bytes();
    match command {
        Command::Reset => mock.expect(&setup(SetupControl::Reset, 0), &STATUS_OK),
        Command::Features => mock.expect(&setup(SetupControl::ReadFeatures, 0), &[0x00, 0x0C]),
        Command::Max { parameter } => mock.expect(
            &setup(SetupControl::ReadSupportedRxTx, parameter.wire_value()),
            &[0x00, 0xFE],
        ),
        Command::Tx {
            channel, pattern, ..
        } => {
            let start = codec::encode_carrier(*channel, config.length, *pattern);
            mock.expect(&start.to_bytes(), &STATUS_OK);
            mock.expect(&end, &STATUS_OK);
        }
        Command::Rx { channel, .. } => {
            let start = codec::encode_receiver(*channel, 0, PacketType::Prbs9);
            mock.expect(&start.to_bytes(), &STATUS_OK);
            mock.expect(&end, &packet_report(1500));
        }
        Command::SweepTx { sweep, pattern } => {
            let width = sweep.sweep().width().max(1);
            for step in 0..mock_sweep_steps(sweep)? {
                let channel = sweep.low + (step % width) as u8;
                script_setup(mock, config, true);
                let start = codec::encode_carrier(channel, config.length, *pattern);
                mock.expect(&start.to_bytes(), &STATUS_OK);
                mock.expect(&end, &STATUS_OK);
            }
        }
        Command::SweepRx { sweep } => {
            let width = sweep.sweep().width().max(1);
            for step in 0..mock_sweep_steps(sweep)? {
                let channel = sweep.low + (step % width) as u8;
                script_setup(mock, config, false);
                let start = codec::encode_receiver(channel, 0, PacketType::Prbs9);
                mock.expect(&start.to_bytes(), &STATUS_OK);
                mock.expect(&end, &packet_report(100 + channel as u16));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

/// "19 (2440 MHz)" for a valid index, the bare number otherwise.
fn channel_label(index: u8) -> String {
    Channel::new(index).map_or_else(|| index.to_string(), |channel| channel.to_string())
}

fn print_event(event: &DtmEvent) {
    match event {
        DtmEvent::Reset => {}
        DtmEvent::Started { kind, channel } => {
            println!("{kind} started on channel {}", channel_label(*channel));
        }
        DtmEvent::Ended {
            kind,
            channel,
            packets: Some(packets),
        } => println!("{kind} ended on channel {channel}: {packets} packets"),
        DtmEvent::Ended { kind, channel, .. } => {
            println!("{kind} ended on channel {channel}")
        }
    }
}

fn print_response(label: &str, response: Option<Response>) -> Result<()> {
    let Some(response) = response else {
        bail!("no response to {label}");
    };
    let [msb, lsb] = response.bytes();
    match response.report() {
        Report::Status { failed: true } => bail!("{label} failed: {msb:02X} {lsb:02X}"),
        Report::Status { failed: false } => println!("{label}: {msb:02X} {lsb:02X}"),
        Report::PacketReport { packets } => {
            println!("{label}: packet report, {packets} packets")
        }
    }
    Ok(())
}

fn print_outcome(outcome: &TestOutcome, channel_low: u8) -> Result<()> {
    if !outcome.success {
        bail!("{}", outcome.message.as_deref().unwrap_or("test failed"));
    }
    println!("Test finished: {} packets received", outcome.received);
    if let Some(per_channel) = &outcome.received_per_channel {
        for (i, count) in per_channel.iter().enumerate() {
            println!("  ch {}: {count}", channel_label(channel_low + i as u8));
        }
    }
    Ok(())
}

/// Drive a test to completion, ending it early on Ctrl-C.
async fn run_test<F>(dtm: &TestController, test: F) -> Result<TestOutcome>
where
    F: Future<Output = dtmlib_core::Result<TestOutcome>>,
{
    tokio::pin!(test);
    let outcome = tokio::select! {
        outcome = &mut test => outcome,
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted, ending test");
            dtm.end_test().await;
            test.await
        }
    };
    outcome.context("test aborted")
}

async fn run(cli: &Cli, dtm: &TestController) -> Result<()> {
    match &cli.command {
        Command::Reset => print_response("reset", dtm.setup_reset().await?),
        Command::Features => print_response("features", dtm.setup_read_features().await?),
        Command::Max { parameter } => print_response(
            "supported maximum",
            dtm.setup_read_supported_rx_tx(*parameter).await?,
        ),
        Command::Tx {
            channel,
            pattern,
            timeout_ms,
        } => {
            println!("Transmitting {pattern}, {} octets", cli.length);
            let test = dtm.single_channel_transmitter_test(
                *pattern,
                cli.length,
                *channel,
                Duration::from_millis(*timeout_ms),
            );
            let outcome = run_test(dtm, test).await?;
            print_outcome(&outcome, *channel)
        }
        Command::Rx {
            channel,
            timeout_ms,
        } => {
            println!("Receiving on {}", cli.phy);
            let test =
                dtm.single_channel_receiver_test(*channel, Duration::from_millis(*timeout_ms));
            let outcome = run_test(dtm, test).await?;
            print_outcome(&outcome, *channel)
        }
        Command::SweepTx { sweep, pattern } => {
            println!(
                "Sweeping transmitter over channels {}..={}",
                sweep.low, sweep.high
            );
            let plan = sweep.sweep();
            let test = dtm.sweep_transmitter_test(*pattern, cli.length, &plan);
            let outcome = run_test(dtm, test).await?;
            print_outcome(&outcome, sweep.low)
        }
        Command::SweepRx { sweep } => {
            println!(
                "Sweeping receiver over channels {}..={}",
                sweep.low, sweep.high
            );
            let plan = sweep.sweep();
            let test = dtm.sweep_receiver_test(&plan);
            let outcome = run_test(dtm, test).await?;
            print_outcome(&outcome, sweep.low)
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let dtm = connect(&cli).await?;
    dtm.add_listener(print_event);

    let result = run(&cli, &dtm).await;

    if let Err(e) = dtm.close().await {
        tracing::warn!(error = %e, "failed to close port");
    }
    result
}
