//! Interruption classifier command.

use anyhow::{Context, Result};
use parley_core::interrupt;

pub fn run(text: &str) -> Result<()> {
    match interrupt::detect(text) {
        Some(found) => {
            let json = serde_json::to_string_pretty(&found).context("serialize match")?;
            println!("{json}");
        }
        None => println!("no match"),
    }
    Ok(())
}
