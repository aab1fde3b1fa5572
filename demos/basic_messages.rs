//! Demo: Basic Message Table Operations
//!
//! Adds, lists and deletes messages on a snapshot-backed store, then reopens
//! the snapshot to show what survived.
//!
//! Run with: cargo run --example basic_messages

use eyre::Result;
use msgtable::{MemoryStore, MessageTable};
use std::time::Duration;

fn main() -> Result<()> {
    // Create a temporary directory for this demo
    let temp_dir = tempfile::tempdir()?;
    let snapshot = temp_dir.path().join("snapshot.jsonl");

    println!("MsgTable Basic Demo");
    println!("===================\n");
    println!("Snapshot: {}\n", snapshot.display());

    let store = MemoryStore::open(&snapshot)?;
    let snapshotter = store.start_snapshots(Duration::from_millis(200))?;
    let table = MessageTable::new(store.clone());
    table.initialize()?;

    println!("1. ADD - three messages...");
    for text in ["first", "second", "third"] {
        let message = table.add_message(text)?;
        println!("   #{} {} {} {}", message.id, message.date, message.time, message.text);
    }
    println!();

    println!("2. DELETE - message 0, twice...");
    println!("   first delete removed: {}", table.delete_message(0)?);
    println!("   second delete removed: {}\n", table.delete_message(0)?);

    println!("3. ADD - ids are never reused...");
    let message = table.add_message("fourth")?;
    println!("   new message got id {}\n", message.id);

    table.verify()?;
    snapshotter.stop()?;

    println!("4. REOPEN - loading the snapshot...");
    let reopened = MessageTable::new(MemoryStore::open(&snapshot)?);
    for (id, message) in reopened.list_messages()? {
        println!("   #{} {}", id, message.text);
    }
    println!("   live index: {:?}", reopened.live_ids()?);

    Ok(())
}
