use clap::{Parser, Subcommand};
use colored::Colorize;
use eyre::{Result, eyre};
use msgtable::{Config, MemoryStore, Message, MessageTable};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "msgtable")]
#[command(about = "MsgTable CLI - message table on an in-memory key/value store")]
#[command(version = env!("GIT_DESCRIBE"))]
struct Cli {
    /// Path to a YAML config file (default: <config dir>/msgtable/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Snapshot file to use instead of the configured one
    #[arg(short, long)]
    snapshot: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reset the message table, discarding all messages
    Init,

    /// Add a message
    Add { text: String },

    /// List all messages
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one message
    Get { id: i64 },

    /// Delete a message (no-op if absent)
    Delete { id: i64 },

    /// Check that the live index and the records agree
    Check,

    /// Rewrite the snapshot file with only current entries
    Compact,

    /// Interactive session with periodic background snapshots
    Shell,
}

fn main() -> Result<()> {
    // Setup tracing; stdout is for command output
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(snapshot) = cli.snapshot {
        config.snapshot_path = snapshot;
    }

    let store = MemoryStore::open(&config.snapshot_path)?;
    let table = MessageTable::with_namespace(store.clone(), &config.namespace)?;

    match cli.command {
        Commands::Init => {
            table.initialize()?;
            println!("Message table initialized");
        }
        Commands::Add { text } => {
            let message = table.add_message(text)?;
            print_message(&message);
        }
        Commands::List { json } => {
            let messages = table.list_messages()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&messages)?);
            } else if messages.is_empty() {
                println!("{}", "No messages".dimmed());
            } else {
                messages.values().for_each(print_message);
            }
        }
        Commands::Get { id } => match table.get_message(id)? {
            Some(message) => print_message(&message),
            None => return Err(eyre!("Message {} not found", id)),
        },
        Commands::Delete { id } => {
            if table.delete_message(id)? {
                println!("Deleted message {}", id);
            } else {
                println!("{}", format!("No message {}", id).dimmed());
            }
        }
        Commands::Check => {
            table.verify()?;
            println!("{}", "Table consistent".green());
        }
        Commands::Compact => {
            let count = store.compact()?;
            println!("Snapshot compacted ({} entries)", count);
            return Ok(());
        }
        Commands::Shell => {
            let snapshotter = store.start_snapshots(config.snapshot_interval())?;
            run_shell(&table)?;
            snapshotter.stop()?;
            return Ok(());
        }
    }

    store.persist()?;
    Ok(())
}

fn print_message(message: &Message) {
    println!(
        "{:>5}  {} {}  {}",
        message.id.to_string().cyan(),
        message.date.dimmed(),
        message.time.dimmed(),
        message.text
    );
}

fn run_shell(table: &MessageTable<MemoryStore>) -> Result<()> {
    println!("Commands: add <text> | list | get <id> | del <id> | check | quit");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("{} ", ">".bold());
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let (command, rest) = line.trim().split_once(' ').unwrap_or((line.trim(), ""));

        let outcome = match command {
            "" => Ok(()),
            "quit" | "exit" => break,
            "add" => table.add_message(rest).map(|message| print_message(&message)),
            "list" => table.list_messages().map(|messages| messages.values().for_each(print_message)),
            "get" => parse_id(rest).and_then(|id| match table.get_message(id)? {
                Some(message) => {
                    print_message(&message);
                    Ok(())
                }
                None => Err(eyre!("Message {} not found", id)),
            }),
            "del" | "delete" => parse_id(rest).and_then(|id| {
                let removed = table.delete_message(id)?;
                println!("{}", if removed { "Deleted" } else { "Not found" });
                Ok(())
            }),
            "check" => table.verify().map(|()| println!("{}", "Table consistent".green())),
            other => Err(eyre!("Unknown command: {}", other)),
        };

        if let Err(e) = outcome {
            eprintln!("{} {:#}", "error:".red(), e);
        }
    }

    Ok(())
}

fn parse_id(s: &str) -> Result<i64> {
    s.trim().parse().map_err(|_| eyre!("Expected a message id, got {:?}", s.trim()))
}
