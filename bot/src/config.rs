//! Command-line settings.

use std::path::PathBuf;

use clap::{App, Arg};

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub cert: Option<PathBuf>,
    pub username: String,
    pub password: String,
    pub log: bool,
    pub debug: bool,
    pub bitrate: u32,
    pub frames: usize,
    pub volume: f32,
    pub privileges: PathBuf,
}

/// Parses the process arguments; clap exits non-zero on invalid input.
pub fn parse() -> Settings {
    let matches = App::new("brumble")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A scriptable Mumble voice-chat bot")
        .arg(
            Arg::new("host")
                .long("host")
                .takes_value(true)
                .default_value("localhost")
                .help("connect to HOSTNAME"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('s')
                .takes_value(true)
                .default_value("64738")
                .help("server port"),
        )
        .arg(
            Arg::new("cert")
                .long("cert")
                .short('c')
                .takes_value(true)
                .help("use certificate/key from PEM file"),
        )
        .arg(
            Arg::new("user")
                .long("user")
                .short('u')
                .takes_value(true)
                .default_value("brumble")
                .help("connect as user NAME"),
        )
        .arg(
            Arg::new("pass")
                .long("pass")
                .short('p')
                .takes_value(true)
                .default_value("")
                .help("password for authentication"),
        )
        .arg(
            Arg::new("log")
                .long("log")
                .short('l')
                .help("enable log file"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .short('d')
                .help("enable debug output"),
        )
        .arg(
            Arg::new("bitrate")
                .long("bitrate")
                .short('b')
                .takes_value(true)
                .default_value("40000")
                .help("audio compression bitrate"),
        )
        .arg(
            Arg::new("frames")
                .long("frames")
                .short('f')
                .takes_value(true)
                .default_value("2")
                .help("audio frames per packet"),
        )
        .arg(
            Arg::new("volume")
                .long("volume")
                .short('v')
                .takes_value(true)
                .default_value("0.10")
                .help("default volume of voice transmission"),
        )
        .arg(
            Arg::new("privileges")
                .long("privileges")
                .takes_value(true)
                .default_value("privileges.txt")
                .help("privilege file"),
        )
        .get_matches();

    Settings {
        host: matches.value_of("host").unwrap_or_default().to_string(),
        port: matches.value_of_t("port").unwrap_or_else(|e| e.exit()),
        cert: matches.value_of("cert").map(PathBuf::from),
        username: matches.value_of("user").unwrap_or_default().to_string(),
        password: matches.value_of("pass").unwrap_or_default().to_string(),
        log: matches.is_present("log"),
        debug: matches.is_present("debug"),
        bitrate: matches.value_of_t("bitrate").unwrap_or_else(|e| e.exit()),
        frames: matches.value_of_t("frames").unwrap_or_else(|e| e.exit()),
        volume: matches.value_of_t("volume").unwrap_or_else(|e| e.exit()),
        privileges: matches
            .value_of("privileges")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("privileges.txt")),
    }
}
