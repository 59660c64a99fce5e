//! Command-line and `btcnode.conf` settings.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use btcnode_consensus::{chain_params, Network};
use btcnode_log::{Filter, Format, Level, LogConfig};

pub const DEFAULT_DATA_DIR: &str = "data";
pub const CONF_FILE_NAME: &str = "btcnode.conf";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fjall => "fjall",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub network: Network,
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub log: LogConfig,
    pub import_path: Option<PathBuf>,
    pub checkpoints: bool,
    /// Zero lets the script verification pool size itself.
    pub verify_workers: usize,
    pub print_state: bool,
    /// Keys present in the conf file that nothing reads.
    pub unsupported_conf_keys: Vec<String>,
}

impl Config {
    /// Per-network store directory under the data dir.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir
            .join(chain_params(self.network).data_dir_name)
            .join("db")
    }
}

#[derive(Debug)]
pub enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

/// Values set so far; the command line wins over the conf file.
#[derive(Default)]
struct Settings {
    network: Option<Network>,
    backend: Option<Backend>,
    log_filter: Option<Filter>,
    log_format: Option<Format>,
    log_timestamps: Option<bool>,
    import_path: Option<PathBuf>,
    checkpoints: Option<bool>,
    verify_workers: Option<usize>,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut settings = Settings::default();
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut print_state = false;
    let mut args = raw_args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--network" => {
                let value = next_value(&mut args, "--network")?;
                settings.network = Some(
                    Network::parse(&value)
                        .ok_or_else(|| format!("invalid network '{value}'\n{}", usage()))?,
                );
            }
            "--data-dir" | "--datadir" => {
                data_dir = Some(PathBuf::from(next_value(&mut args, "--data-dir")?));
            }
            "--conf" => {
                conf_path = Some(PathBuf::from(next_value(&mut args, "--conf")?));
            }
            "--backend" => {
                let value = next_value(&mut args, "--backend")?;
                settings.backend = Some(
                    Backend::parse(&value)
                        .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?,
                );
            }
            "--log-level" | "--loglevel" => {
                let value = next_value(&mut args, "--log-level")?;
                settings.log_filter = Some(
                    Filter::parse(&value).map_err(|err| format!("{err}\n{}", usage()))?,
                );
            }
            "--log-format" | "--logformat" => {
                let value = next_value(&mut args, "--log-format")?;
                settings.log_format = Some(
                    Format::parse(&value)
                        .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?,
                );
            }
            "--log-timestamps" | "--logtimestamps" => settings.log_timestamps = Some(true),
            "--no-log-timestamps" | "--no-logtimestamps" => settings.log_timestamps = Some(false),
            "--import" => {
                settings.import_path = Some(PathBuf::from(next_value(&mut args, "--import")?));
            }
            "--no-checkpoints" | "--nocheckpoints" => settings.checkpoints = Some(false),
            "--verify-workers" => {
                let value = next_value(&mut args, "--verify-workers")?;
                settings.verify_workers = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| format!("invalid verify workers '{value}'\n{}", usage()))?,
                );
            }
            "--print-state" => print_state = true,
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let explicit_conf = conf_path.is_some();
    let conf_file = conf_path.unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    let mut unsupported_conf_keys = Vec::new();
    match load_conf(&conf_file)? {
        Some(conf) => unsupported_conf_keys = apply_conf(&mut settings, &conf, &conf_file)?,
        None if explicit_conf => {
            return Err(format!("config file {} not found", conf_file.display()));
        }
        None => {}
    }

    let filter = settings.log_filter;
    let log = LogConfig {
        level: filter
            .as_ref()
            .and_then(Filter::default_level)
            .unwrap_or(Level::Info),
        format: settings.log_format.unwrap_or(Format::Text),
        timestamps: settings.log_timestamps.unwrap_or(true),
        filter,
    };

    Ok(CliAction::Run(Box::new(Config {
        network: settings.network.unwrap_or(Network::Mainnet),
        backend: settings.backend.unwrap_or(Backend::Fjall),
        data_dir,
        conf_path: conf_file,
        log,
        import_path: settings.import_path,
        checkpoints: settings.checkpoints.unwrap_or(true),
        verify_workers: settings.verify_workers.unwrap_or(0),
        print_state,
        unsupported_conf_keys,
    })))
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next()
        .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
}

/// Reads `key=value` lines; a bare key means `1`. Keys are case and dash insensitive.
fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = line[..idx].trim();
        }
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        let key: String = key
            .chars()
            .filter(|ch| *ch != '-' && *ch != '_')
            .map(|ch| ch.to_ascii_lowercase())
            .collect();
        out.entry(key).or_default().push(value.to_string());
    }
    Ok(Some(out))
}

fn apply_conf(
    settings: &mut Settings,
    conf: &HashMap<String, Vec<String>>,
    conf_file: &Path,
) -> Result<Vec<String>, String> {
    let last = |key: &str| conf.get(key).and_then(|values| values.last());
    let invalid = |key: &str, raw: &str| format!("invalid {key} '{raw}' in {}", conf_file.display());
    let flag = |key: &str| -> Result<Option<bool>, String> {
        match last(key) {
            Some(raw) => parse_conf_bool(raw).map(Some).ok_or_else(|| invalid(key, raw)),
            None => Ok(None),
        }
    };

    if settings.network.is_none() {
        if let Some(raw) = last("network") {
            settings.network = Some(Network::parse(raw).ok_or_else(|| invalid("network", raw))?);
        } else if flag("regtest")? == Some(true) {
            settings.network = Some(Network::Regtest);
        } else if flag("testnet")? == Some(true) {
            settings.network = Some(Network::Testnet);
        }
    }
    if settings.backend.is_none() {
        if let Some(raw) = last("backend") {
            settings.backend = Some(Backend::parse(raw).ok_or_else(|| invalid("backend", raw))?);
        }
    }
    if settings.log_filter.is_none() {
        if let Some(raw) = last("loglevel") {
            settings.log_filter = Some(Filter::parse(raw).map_err(|_| invalid("loglevel", raw))?);
        }
    }
    if settings.log_format.is_none() {
        if let Some(raw) = last("logformat") {
            settings.log_format = Some(Format::parse(raw).ok_or_else(|| invalid("logformat", raw))?);
        }
    }
    if settings.log_timestamps.is_none() {
        settings.log_timestamps = flag("logtimestamps")?;
    }
    if settings.import_path.is_none() {
        settings.import_path = last("import").map(PathBuf::from);
    }
    if settings.checkpoints.is_none() {
        settings.checkpoints = flag("checkpoints")?;
    }
    if settings.verify_workers.is_none() {
        if let Some(raw) = last("verifyworkers") {
            settings.verify_workers = Some(
                raw.parse::<usize>()
                    .map_err(|_| invalid("verifyworkers", raw))?,
            );
        }
    }

    const KNOWN: [&str; 10] = [
        "network",
        "regtest",
        "testnet",
        "backend",
        "loglevel",
        "logformat",
        "logtimestamps",
        "import",
        "checkpoints",
        "verifyworkers",
    ];
    let mut unsupported: Vec<String> = conf
        .keys()
        .filter(|key| !KNOWN.contains(&key.as_str()))
        .cloned()
        .collect();
    unsupported.sort();
    Ok(unsupported)
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn usage() -> String {
    [
        "Usage:",
        "  btcnode [options]",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --network  Network selection: mainnet|testnet|regtest (default: mainnet)",
        "  --data-dir  Base data directory (default: ./data)",
        "  --conf  Config file path (default: <data-dir>/btcnode.conf)",
        "  --backend  Storage backend: fjall|memory (default: fjall)",
        "  --log-level  Level or filter, e.g. info,btcnode_chainstate=debug (default: info)",
        "  --log-format  Log output format: text|json (default: text)",
        "  --log-timestamps  Prefix log lines with timestamps (default)",
        "  --no-log-timestamps  Omit log timestamps",
        "  --import  Bootstrap file of length-prefixed blocks to process",
        "  --no-checkpoints  Disable checkpoint enforcement",
        "  --verify-workers  Script verification threads (default: 0 = auto)",
        "  --print-state  Print the best chain state as JSON before exiting",
    ]
    .join("\n")
}
