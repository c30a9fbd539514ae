//! Device id command implementation.

use crate::context::Context;

/// Prints this device's id, creating it on first use.
pub fn run(context: &Context) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", context.device_id()?);
    Ok(())
}
