// Copyright 2021 Locha Mesh Developers <contact@locha.io>
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

use std::{
    io::{self, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::{
    crate_authors, crate_version, App, AppSettings, Arg, ArgMatches,
    SubCommand,
};
use serial::SystemPort;

use ra_dfu::{constants, Device, Error};

mod list;
mod ops;
mod secure;

#[cfg(unix)]
const DEFAULT_PORT: &str = "/dev/ttyACM0";
#[cfg(windows)]
const DEFAULT_PORT: &str = "COM0";

fn main() -> Result<()> {
    let app = App::new("Renesas RA Boot Firmware Programmer")
        .setting(AppSettings::ColoredHelp)
        .version(crate_version!())
        .author(crate_authors!())
        .about("Device firmware update tool for the serial boot interface of Renesas RA microcontrollers")
        .arg(
            Arg::with_name("PORT")
                .short("p")
                .long("port")
                .default_value(DEFAULT_PORT)
                .help("Serial port to use")
        )
        .arg(
            Arg::with_name("baudrate")
                .short("b")
                .long("baudrate")
                .default_value("921600")
                .help("Line rate ceiling for UART sessions; the tool negotiates the best supported rate not above this and the device's recommendation")
        )
        .arg(
            Arg::with_name("uart")
                .long("uart")
                .help("Treat the port as a raw UART (SCI boot) instead of USB-CDC: negotiate the line rate after connecting and restore 9600 bps on close")
        )
        .arg(
            Arg::with_name("id")
                .long("id")
                .takes_value(true)
                .help("Id code for authentication, 32 hex characters with optional 0x prefix")
        )
        .arg(
            Arg::with_name("erase-all")
                .long("erase-all")
                .conflicts_with("id")
                .help("Authenticate with the ALeRASE id code, requesting a total-area erase on devices whose OSIS setting allows it")
        )
        .arg(
            Arg::with_name("invoke-boot")
                .long("invoke-boot")
                .help("Pulse the MD and !RESET pins through DTR/RTS to enter boot mode (on boards that wire them to the adapter)")
        )
        .arg(
            Arg::with_name("invoke-inverted")
                .long("invoke-inverted")
                .help("Swap the DTR/RTS roles when using --invoke-boot")
        )
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity, -v (debug), -vv (trace)")
        )
        .subcommand(
            SubCommand::with_name("list")
                .about("List serial ports")
        )
        .subcommand(
            SubCommand::with_name("info")
                .about("Show signature, memory areas and security state")
        )
        .subcommand(
            SubCommand::with_name("read")
                .about("Read device memory into a file (bin/ihex/srec by extension)")
                .arg(
                    Arg::with_name("FILE")
                        .required(true)
                        .takes_value(true)
                        .help("Output file")
                )
                .arg(
                    Arg::with_name("address")
                        .short("a")
                        .long("address")
                        .default_value("0x0")
                        .help("Start address")
                )
                .arg(
                    Arg::with_name("size")
                        .short("s")
                        .long("size")
                        .default_value("0")
                        .help("Byte count; 0 reads to the end of the area")
                )
        )
        .subcommand(
            SubCommand::with_name("write")
                .about("Write a firmware file into device memory")
                .arg(
                    Arg::with_name("FILE")
                        .required(true)
                        .takes_value(true)
                        .help("Firmware file to write")
                )
                .arg(
                    Arg::with_name("address")
                        .short("a")
                        .long("address")
                        .default_value("0x0")
                        .help("Start address; overrides the address carried by ihex/srec files")
                )
                .arg(
                    Arg::with_name("input-format")
                        .long("input-format")
                        .default_value("auto")
                        .help("Input format [auto|bin|ihex|srec]")
                )
                .arg(
                    Arg::with_name("erase")
                        .short("e")
                        .long("erase")
                        .help("Erase the target range first")
                )
                .arg(
                    Arg::with_name("verify")
                        .long("verify")
                        .help("Read the range back and compare after writing")
                )
        )
        .subcommand(
            SubCommand::with_name("verify")
                .about("Compare device memory against a firmware file")
                .arg(
                    Arg::with_name("FILE")
                        .required(true)
                        .takes_value(true)
                        .help("Firmware file to compare against")
                )
                .arg(
                    Arg::with_name("address")
                        .short("a")
                        .long("address")
                        .default_value("0x0")
                        .help("Start address; overrides the address carried by ihex/srec files")
                )
                .arg(
                    Arg::with_name("input-format")
                        .long("input-format")
                        .default_value("auto")
                        .help("Input format [auto|bin|ihex|srec]")
                )
        )
        .subcommand(
            SubCommand::with_name("erase")
                .about("Erase a memory range")
                .arg(
                    Arg::with_name("address")
                        .short("a")
                        .long("address")
                        .default_value("0x0")
                        .help("Start address, on an erase-unit boundary")
                )
                .arg(
                    Arg::with_name("size")
                        .short("s")
                        .long("size")
                        .default_value("0")
                        .help("Byte count; 0 erases to the end of the area")
                )
        )
        .subcommand(
            SubCommand::with_name("blank-check")
                .about("Check that a memory range is erased")
                .arg(
                    Arg::with_name("address")
                        .short("a")
                        .long("address")
                        .default_value("0x0")
                        .help("Start address")
                )
                .arg(
                    Arg::with_name("size")
                        .short("s")
                        .long("size")
                        .default_value("0")
                        .help("Byte count; 0 checks to the end of the area")
                )
        )
        .subcommand(
            SubCommand::with_name("crc")
                .about("Ask the device for the CRC-32 of a memory range")
                .arg(
                    Arg::with_name("address")
                        .short("a")
                        .long("address")
                        .default_value("0x0")
                        .help("Start address")
                )
                .arg(
                    Arg::with_name("size")
                        .short("s")
                        .long("size")
                        .default_value("0")
                        .help("Byte count; 0 covers the rest of the area")
                )
        )
        .subcommand(
            SubCommand::with_name("dlm")
                .about("Show the device lifecycle state")
        )
        .subcommand(
            SubCommand::with_name("dlm-transit")
                .about("Request a lifecycle transition that needs no key")
                .arg(
                    Arg::with_name("STATE")
                        .required(true)
                        .takes_value(true)
                        .help("Target state [ssd|nsecsd|dpl|lck_dbg|lck_boot|...]")
                )
        )
        .subcommand(
            SubCommand::with_name("dlm-auth")
                .about("Request a key-authenticated lifecycle transition")
                .arg(
                    Arg::with_name("STATE")
                        .required(true)
                        .takes_value(true)
                        .help("Target state")
                )
                .arg(
                    Arg::with_name("KEY")
                        .required(true)
                        .takes_value(true)
                        .help("Key material, `file:<path>` (16-byte binary) or `hex:<32-hex-chars>`")
                )
        )
        .subcommand(
            SubCommand::with_name("boundary")
                .about("Show the TrustZone boundary settings")
        )
        .subcommand(
            SubCommand::with_name("boundary-set")
                .about("Program the TrustZone boundary settings")
                .arg(Arg::with_name("cfs1").long("cfs1").default_value("0")
                     .help("Secure code flash size in KB"))
                .arg(Arg::with_name("cfs2").long("cfs2").default_value("0")
                     .help("Secure + NSC code flash size in KB"))
                .arg(Arg::with_name("dfs").long("dfs").default_value("0")
                     .help("Secure data flash size in KB"))
                .arg(Arg::with_name("srs1").long("srs1").default_value("0")
                     .help("Secure SRAM size in KB"))
                .arg(Arg::with_name("srs2").long("srs2").default_value("0")
                     .help("Secure + NSC SRAM size in KB"))
        )
        .subcommand(
            SubCommand::with_name("param")
                .about("Show whether serial programming is enabled")
        )
        .subcommand(
            SubCommand::with_name("param-set")
                .about("Enable or disable serial programming")
                .arg(
                    Arg::with_name("MODE")
                        .required(true)
                        .takes_value(true)
                        .possible_values(&["enable", "disable"])
                        .help("New setting")
                )
        )
        .subcommand(
            SubCommand::with_name("init")
                .about("Factory-initialize the device, erasing all user areas and protection settings")
        )
        .subcommand(
            SubCommand::with_name("osis")
                .about("Probe the serial-programmer id protection (OSIS)")
        )
        .subcommand(
            SubCommand::with_name("key-set")
                .about("Inject a wrapped key into a typed slot")
                .arg(
                    Arg::with_name("TYPE")
                        .required(true)
                        .takes_value(true)
                        .help("Key slot [secdbg|nonsecdbg|rma]")
                )
                .arg(
                    Arg::with_name("KEY")
                        .required(true)
                        .takes_value(true)
                        .help("Key material, `file:<path>` or `hex:<hex-chars>`")
                )
        )
        .subcommand(
            SubCommand::with_name("key-verify")
                .about("Verify the wrapped key stored in a typed slot")
                .arg(
                    Arg::with_name("TYPE")
                        .required(true)
                        .takes_value(true)
                        .help("Key slot [secdbg|nonsecdbg|rma]")
                )
        )
        .subcommand(
            SubCommand::with_name("ukey-set")
                .about("Inject a wrapped key into a numbered user slot")
                .arg(
                    Arg::with_name("INDEX")
                        .required(true)
                        .takes_value(true)
                        .help("User key slot index")
                )
                .arg(
                    Arg::with_name("KEY")
                        .required(true)
                        .takes_value(true)
                        .help("Key material, `file:<path>` or `hex:<hex-chars>`")
                )
        )
        .subcommand(
            SubCommand::with_name("ukey-verify")
                .about("Verify the wrapped key stored in a numbered user slot")
                .arg(
                    Arg::with_name("INDEX")
                        .required(true)
                        .takes_value(true)
                        .help("User key slot index")
                )
        );

    // When double clicking the binary the binary will be paused. Useful on
    // windows, since the Console window will be closed inmediately.
    #[cfg(windows)]
    let app = app.setting(AppSettings::WaitOnError);

    let matches = app.get_matches();

    init_logger(match matches.occurrences_of("v") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        2..=u64::MAX => log::LevelFilter::Trace,
    })?;

    if matches.is_present("invoke-inverted")
        && !matches.is_present("invoke-boot")
    {
        anyhow::bail!("--invoke-inverted can't be used if --invoke-boot is not specified. See --help for more information");
    }

    if let ("list", _) = matches.subcommand() {
        return list::list();
    }
    if matches.subcommand_name().is_none() {
        println!("Error: Sub-command required");
        println!("{}", matches.usage());
        std::process::exit(2);
    }

    let opts = Opts::from_matches(&matches)?;

    log::info!("Opening serial port `{}`", opts.port.display());
    let mut port =
        SystemPort::open(&opts.port).with_context(|| {
            format!("Couldn't open serial port `{}`", opts.port.display())
        })?;

    if matches.is_present("invoke-boot") {
        log::info!("Entering boot mode through DTR/RTS");
        ra_dfu::enter_boot_mode(
            &mut port,
            matches.is_present("invoke-inverted"),
        )
        .context("Failed to enter boot mode")?;
    }

    log::info!("Connecting to the boot firmware");
    let mut device = Device::connect(port, opts.uart)
        .context("Failed to connect to the boot firmware")?;

    log::info!(
        "Device: {} {} ({}), boot firmware {}",
        device.signature().product,
        device.family(),
        device.family().core_name(),
        device.signature().version_string()
    );

    authenticate(&matches, &opts, &mut device)?;

    if opts.uart {
        let rate = device
            .negotiate_baud(opts.baudrate)
            .context("Baud negotiation failed")?;
        log::info!("Line rate: {} bps", rate);
    }

    let result = run(&matches, &mut device);
    device.close();

    result
}

fn run(
    matches: &ArgMatches<'_>,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    match matches.subcommand() {
        ("info", Some(_)) => ops::info(device),
        ("read", Some(m)) => ops::read(m, device),
        ("write", Some(m)) => ops::write(m, device),
        ("verify", Some(m)) => ops::verify(m, device),
        ("erase", Some(m)) => ops::erase(m, device),
        ("blank-check", Some(m)) => ops::blank_check(m, device),
        ("crc", Some(m)) => ops::crc(m, device),
        ("dlm", Some(_)) => secure::dlm(device),
        ("dlm-transit", Some(m)) => secure::dlm_transit(m, device),
        ("dlm-auth", Some(m)) => secure::dlm_auth(m, device),
        ("boundary", Some(_)) => secure::boundary(device),
        ("boundary-set", Some(m)) => secure::boundary_set(m, device),
        ("param", Some(_)) => secure::param(device),
        ("param-set", Some(m)) => secure::param_set(m, device),
        ("init", Some(_)) => secure::init(device),
        ("osis", Some(_)) => secure::osis(device),
        ("key-set", Some(m)) => secure::key_set(m, device),
        ("key-verify", Some(m)) => secure::key_verify(m, device),
        ("ukey-set", Some(m)) => secure::ukey_set(m, device),
        ("ukey-verify", Some(m)) => secure::ukey_verify(m, device),
        _ => unreachable!(),
    }
}

/// Authenticate when the user supplied an id, or when the device
/// group authenticates through the OSIS id code. An `ERR_PCKT`
/// refusal means the device never had an id programmed and needs no
/// authentication.
fn authenticate(
    matches: &ArgMatches<'_>,
    opts: &Opts,
    device: &mut Device<SystemPort>,
) -> Result<()> {
    let explicit = matches.is_present("erase-all") || opts.id.is_some();
    if !explicit && !device.family().supports_id_code() {
        return Ok(());
    }

    let id_code = if matches.is_present("erase-all") {
        log::warn!(
            "Authenticating with the ALeRASE id; devices that accept \
             it erase all user areas"
        );
        constants::ALL_ERASE_ID
    } else {
        opts.id.unwrap_or([0xFF; 16])
    };

    match device.authenticate(&id_code) {
        Ok(()) => {
            log::debug!("Id authentication accepted");
            Ok(())
        }
        Err(Error::Mcu { code: constants::ERR_PACKET, .. }) => {
            log::debug!("Device does not require id authentication");
            Ok(())
        }
        Err(e) => Err(e).context("Id authentication failed"),
    }
}

struct Opts {
    port: PathBuf,
    baudrate: u32,
    uart: bool,
    id: Option<[u8; 16]>,
}

impl Opts {
    fn from_matches(matches: &ArgMatches<'_>) -> Result<Opts> {
        Ok(Opts {
            port: PathBuf::from(matches.value_of("PORT").unwrap()),
            baudrate: matches
                .value_of("baudrate")
                .unwrap()
                .parse()
                .context("Invalid baud rate")?,
            uart: matches.is_present("uart"),
            id: match matches.value_of("id") {
                Some(id) => Some(secure::parse_id_code(id)?),
                None => None,
            },
        })
    }
}

fn init_logger(level: log::LevelFilter) -> Result<()> {
    let mut logger = env_logger::Builder::from_env("RA_DFU_LOG");
    logger.filter_level(level);

    #[cfg(unix)]
    logger.format(log_format_color);
    #[cfg(not(unix))]
    logger.format(log_format_no_color);

    logger.try_init().context("Failed to initialize logger")
}

#[cfg(unix)]
fn log_format_color(
    fmt: &mut env_logger::fmt::Formatter,
    record: &log::Record<'_>,
) -> io::Result<()> {
    let level = match record.level() {
        log::Level::Error => ansi_term::Color::Red.bold().paint("ERROR"),
        log::Level::Warn => ansi_term::Color::Yellow.bold().paint("WARN"),
        log::Level::Info => ansi_term::Color::Green.bold().paint("INFO"),
        log::Level::Debug => ansi_term::Color::Cyan.bold().paint("DBG"),
        log::Level::Trace => ansi_term::Color::Cyan.bold().paint("TRACE"),
    };

    writeln!(fmt, "[{}] - {}", level, record.args())
}

#[cfg(not(unix))]
fn log_format_no_color(
    fmt: &mut env_logger::fmt::Formatter,
    record: &log::Record<'_>,
) -> io::Result<()> {
    let level = match record.level() {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN",
        log::Level::Info => "INFO",
        log::Level::Debug => "DBG",
        log::Level::Trace => "TRACE",
    };

    writeln!(fmt, "[{}] - {}", level, record.args())
}
