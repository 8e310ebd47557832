use std::path::Path;

use crate::cmd::{command_kit, parse_register, parse_value, WriteArgs};
use crate::exit::{kit_error, CliResult, SUCCESS};
use crate::output::{print_write, OutputFormat};

pub fn run(args: WriteArgs, config: Option<&Path>, format: OutputFormat) -> CliResult<i32> {
    let addr = parse_register(&args.register)?;
    let value = parse_value(&args.value);
    let kit = command_kit(config, args.target.as_deref())?;
    let ack = kit
        .write(addr, value)
        .map_err(|err| kit_error(&format!("write {} failed", args.register), err))?;
    print_write(&args.register, &ack, format);
    Ok(SUCCESS)
}
