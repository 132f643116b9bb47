extern crate clap;
extern crate ctrlc;
extern crate env_logger;
extern crate failure;
#[macro_use]
extern crate log;
extern crate serde_json;
extern crate server;
extern crate telemetry;
#[cfg(test)]
extern crate tempfile;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use failure::Error;
use server::{Config, Dispatcher};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::process;
use std::sync::atomic::Ordering;

/// Writes log lines to standard error and to a file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn main() {
    let matches = App::new("sensorlink")
        .author("Pete Gadomski <pete@gadom.ski>")
        .about("collects telemetry from field sensor units")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("log-file")
                .long("log-file")
                .takes_value(true)
                .global(true)
                .help("also append log messages to this file"),
        )
        .subcommand(
            SubCommand::with_name("serve")
                .about("listens for datagrams and stores completed readings")
                .arg(
                    Arg::with_name("CONFIG")
                        .help("the path to the configuration toml file")
                        .index(1),
                )
                .arg(
                    Arg::with_name("address")
                        .long("address")
                        .short("a")
                        .takes_value(true)
                        .help("the address to bind to, overriding the configuration"),
                )
                .arg(
                    Arg::with_name("port")
                        .long("port")
                        .short("p")
                        .takes_value(true)
                        .help("the port to bind to, overriding the configuration"),
                ),
        )
        .subcommand(
            SubCommand::with_name("replay")
                .about("reassembles datagrams from a file, one per line, and prints the readings")
                .arg(
                    Arg::with_name("FILE")
                        .help("the file of datagrams")
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(
            SubCommand::with_name("decode")
                .about("decodes a single datagram")
                .arg(
                    Arg::with_name("DATAGRAM")
                        .help("the datagram text")
                        .required(true)
                        .index(1),
                ),
        )
        .get_matches();

    if let Err(err) = init_logger(matches.value_of("log-file")) {
        eprintln!("could not open log file: {}", err);
        process::exit(1);
    }

    let result = match matches.subcommand() {
        ("serve", Some(matches)) => serve(matches),
        ("replay", Some(matches)) => replay(matches),
        ("decode", Some(matches)) => decode(matches),
        _ => unreachable!(),
    };
    if let Err(err) = result {
        error!("{}", err);
        process::exit(1);
    }
}

fn init_logger(log_file: Option<&str>) -> Result<(), Error> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(Tee { file: file })));
    }
    builder.init();
    Ok(())
}

fn serve(matches: &ArgMatches) -> Result<(), Error> {
    let mut config = match matches.value_of("CONFIG") {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    if let Some(address) = matches.value_of("address") {
        config.address = address.to_string();
    }
    if let Some(port) = matches.value_of("port") {
        config.port = port.parse()?;
    }

    let fanout = server::fanout(&config)?;
    let mut dispatcher = Dispatcher::bind(&config, fanout)?;
    let running = dispatcher.shutdown_handle();
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })?;
    info!("waiting for data on {}, press Ctrl+C to stop", config.socket_address());
    dispatcher.run()?;
    info!("shutdown complete");
    Ok(())
}

fn replay(matches: &ArgMatches) -> Result<(), Error> {
    let text = std::fs::read_to_string(matches.value_of("FILE").unwrap())?;
    for reading in telemetry::reassemble(text.lines()) {
        println!("{}", serde_json::to_string(&reading)?);
    }
    Ok(())
}

fn decode(matches: &ArgMatches) -> Result<(), Error> {
    let datagram = matches.value_of("DATAGRAM").unwrap();
    let fragment = telemetry::decode(datagram.as_bytes())?;
    println!("{}", serde_json::to_string_pretty(&fragment)?);
    Ok(())
}
