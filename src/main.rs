//! Purpose: `tunercard` diagnostic CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Successful commands print exactly one JSON document on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use tunercard::api::{
    self, BlockKind, Error, ErrorKind, READER_INFO_SIZE, Registry, RegistryOptions, SlotInfo,
    StaticEnumerator, make_block, to_exit_code,
};

const LOG_ENV: &str = "TUNERCARD_LOG";
const DEFAULT_NAME: &str = "tunercard";

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let code = if err.kind() == ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                {
                    2
                } else {
                    0
                };
                return Ok(code);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage).with_message(clap_error_summary(&err)));
            }
        },
    };

    let value = match cli.command {
        Command::Atr { atr } => atr_json(&parse_hex(&atr)?)?,
        Command::Block { code, payload, seq } => {
            let code = parse_code(&code)?;
            let payload = match payload {
                Some(text) => parse_hex(&text)?,
                None => Vec::new(),
            };
            block_json(code, &payload, seq)?
        }
        Command::Registry { command } => {
            let options = registry_options(cli.dir, cli.name, cli.id_filter);
            registry_command(command, options)?
        }
    };
    emit_json(value);
    Ok(0)
}

#[derive(Parser)]
#[command(
    name = "tunercard",
    version,
    about = "Inspect smart-card ATRs, T=1 blocks and the shared reader registry",
    long_about = None,
    after_help = r#"EXAMPLES
  $ tunercard atr 3BF01200FF9181B17C451F0399
  $ tunercard block c1 fe
  $ tunercard registry update --device '/dev/tuner/px4-0=tunercard'
  $ tunercard registry show

Set TUNERCARD_LOG=debug to trace protocol decisions on stderr."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Registry directory (default: $TUNERCARD_DIR, /dev/shm, then the temp dir)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        default_value = DEFAULT_NAME,
        help = "Friendly name devices must report; also names the registry"
    )]
    name: String,
    #[arg(
        long = "id-filter",
        global = true,
        help = "Only use slots whose stable id matches (`*` matches one character)"
    )]
    id_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Parse an Answer-To-Reset and print the derived parameters")]
    Atr {
        #[arg(help = "ATR bytes as hex (spaces and colons allowed)")]
        atr: String,
    },
    #[command(about = "Build one T=1 block and print its bytes")]
    Block {
        #[arg(help = "Block code: 00 for I, 8x for R, Cx for S (hex)")]
        code: String,
        #[arg(help = "Information field as hex")]
        payload: Option<String>,
        #[arg(long, default_value_t = 0, help = "Sequence bit for I and R blocks")]
        seq: u8,
    },
    #[command(about = "Inspect or refresh the shared reader registry")]
    Registry {
        #[command(subcommand)]
        command: RegistryCommand,
    },
}

#[derive(Subcommand)]
enum RegistryCommand {
    #[command(about = "Print every slot")]
    Show,
    #[command(about = "Reconcile slots against an explicit device list")]
    Update {
        #[arg(
            long = "device",
            value_name = "PATH=FRIENDLY",
            help = "Present device as path and friendly name (repeatable)"
        )]
        devices: Vec<String>,
    },
    #[command(about = "Resolve one slot, refreshing once if it is empty")]
    Slot {
        #[arg(help = "Slot index")]
        index: u32,
        #[arg(
            long = "device",
            value_name = "PATH=FRIENDLY",
            help = "Present device as path and friendly name (repeatable)"
        )]
        devices: Vec<String>,
    },
}

fn registry_options(
    dir: Option<PathBuf>,
    name: String,
    id_filter: Option<String>,
) -> RegistryOptions {
    let mut options = RegistryOptions::new(name).with_user_size(READER_INFO_SIZE);
    if let Some(dir) = dir {
        options = options.with_dir(dir);
    }
    if let Some(filter) = id_filter {
        options = options.with_id_filter(filter);
    }
    options
}

fn registry_command(command: RegistryCommand, options: RegistryOptions) -> Result<Value, Error> {
    match command {
        RegistryCommand::Show => {
            let registry = Registry::open(options, StaticEnumerator::default())?;
            Ok(registry_json(&registry, &registry.slots()))
        }
        RegistryCommand::Update { devices } => {
            let devices = parse_devices(&devices)?;
            let registry = Registry::open(options, StaticEnumerator::new(devices))?;
            registry.update()?;
            Ok(registry_json(&registry, &registry.slots()))
        }
        RegistryCommand::Slot { index, devices } => {
            let devices = parse_devices(&devices)?;
            let registry = Registry::open(options, StaticEnumerator::new(devices))?;
            let slot = registry.get_slot(index)?;
            Ok(json!({ "slot": slot_json(&slot) }))
        }
    }
}

fn parse_devices(entries: &[String]) -> Result<Vec<(String, String)>, Error> {
    entries
        .iter()
        .map(|entry| {
            entry
                .rsplit_once('=')
                .filter(|(path, friendly)| !path.is_empty() && !friendly.is_empty())
                .map(|(path, friendly)| (path.to_string(), friendly.to_string()))
                .ok_or_else(|| {
                    Error::new(ErrorKind::Usage)
                        .with_message(format!("device {entry:?} is not PATH=FRIENDLY"))
                })
        })
        .collect()
}

fn registry_json(registry: &Registry, slots: &[SlotInfo]) -> Value {
    json!({
        "registry": {
            "name": registry.name(),
            "path": registry.path().display().to_string(),
            "user_size": registry.user_size(),
        },
        "slots": slots.iter().map(slot_json).collect::<Vec<_>>(),
    })
}

fn slot_json(slot: &SlotInfo) -> Value {
    serde_json::to_value(slot).unwrap_or_else(|_| json!({ "index": slot.index }))
}

fn atr_json(bytes: &[u8]) -> Result<Value, Error> {
    let params = api::atr::parse(bytes)?;
    let params = serde_json::to_value(params).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode parameters")
            .with_source(err)
    })?;
    Ok(json!({ "atr": hex::encode(bytes), "params": params }))
}

fn block_json(code: u8, payload: &[u8], seq: u8) -> Result<Value, Error> {
    if seq > 1 {
        return Err(Error::new(ErrorKind::Usage).with_message("--seq must be 0 or 1"));
    }
    let block = make_block(code, payload, seq)?;
    let kind = match block.kind() {
        BlockKind::Information => "I",
        BlockKind::ReceiveReady => "R",
        BlockKind::Supervisory => "S",
    };
    let bytes = block.as_bytes();
    Ok(json!({
        "block": hex::encode(bytes),
        "kind": kind,
        "pcb": format!("{:02x}", block.pcb()),
        "len": block.payload().len(),
        "edc": format!("{:02x}", bytes[bytes.len() - 1]),
    }))
}

fn parse_hex(text: &str) -> Result<Vec<u8>, Error> {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    hex::decode(&cleaned).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("{text:?} is not hex"))
            .with_source(err)
    })
}

fn parse_code(text: &str) -> Result<u8, Error> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u8::from_str_radix(digits, 16).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("block code {text:?} is not a hex byte"))
            .with_source(err)
    })
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches("error: ").to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("error: {}", error_message(err));
        for cause in error_causes(err) {
            eprintln!("  caused by: {cause}");
        }
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    format!("{:?}", err.kind())
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(slot) = err.slot() {
        inner.insert("slot".to_string(), json!(slot));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}
