//! Named register fields on a simulated device.
//!
//! Run with:
//!   cargo run --example schema-registers

use instrlink::{Kit, KitConfig, RegisterAddr};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = KitConfig::from_json_str(
        r#"{
            "command": {"transport": "sim", "target": "sim://bench"},
            "schema": {"inline": {"device": "bench", "registers": [
                {"name": "STATUS", "address": "0x10", "bit_width": 8, "default": 1},
                {"name": "MODE", "address": "0x14", "bit_offset": 4, "bit_width": 2,
                 "format": {"enum": {"IDLE": 0, "RUN": 1, "HOLD": 2}}, "default": "IDLE"},
                {"name": "GAIN", "address": "0x18",
                 "format": {"fixed": {"frac_bits": 8, "signed": true}}}
            ]}}
        }"#,
    )?;
    let mut kit = Kit::new(config)?;
    kit.start_command()?;

    let applied = kit.apply_defaults()?;
    eprintln!("applied {applied} defaults");

    kit.write("MODE", "RUN")?;
    kit.write("GAIN", -1.5)?;

    let names = ["STATUS", "MODE", "GAIN"].map(RegisterAddr::from);
    for (name, value) in names.iter().zip(kit.bulk_read(names.clone())?) {
        match value {
            Ok(value) => eprintln!("{name} = {value}"),
            Err(err) => eprintln!("{name}: {err}"),
        }
    }

    let word = kit.read(0x14u32)?;
    eprintln!("raw word at 0x14: {word}");

    kit.stop_command()?;
    Ok(())
}
