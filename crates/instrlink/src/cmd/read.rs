use std::path::Path;

use crate::cmd::{command_kit, parse_register, ReadArgs};
use crate::exit::{kit_error, CliResult, SUCCESS};
use crate::output::{print_read, OutputFormat};

pub fn run(args: ReadArgs, config: Option<&Path>, format: OutputFormat) -> CliResult<i32> {
    let addr = parse_register(&args.register)?;
    let kit = command_kit(config, args.target.as_deref())?;
    let value = kit
        .read(addr)
        .map_err(|err| kit_error(&format!("read {} failed", args.register), err))?;
    print_read(&args.register, &value, format);
    Ok(SUCCESS)
}
