use std::path::Path;

use instrlink_frame::{BlockMode, REG_WORD};

use crate::cmd::{command_kit, parse_number, DumpArgs};
use crate::exit::{kit_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_dump, OutputFormat};

pub fn run(args: DumpArgs, config: Option<&Path>, format: OutputFormat) -> CliResult<i32> {
    let base = parse_number(&args.base)
        .and_then(|value| u32::try_from(value).ok())
        .ok_or_else(|| CliError::new(DATA_INVALID, format!("invalid base address {:?}", args.base)))?;
    let mode = if args.repeat {
        BlockMode::Loop
    } else {
        BlockMode::Increment
    };

    let kit = command_kit(config, args.target.as_deref())?;
    let data = kit
        .block_read(base, args.length, mode)
        .map_err(|err| kit_error("block read failed", err))?;
    print_dump(base, &data, REG_WORD, !args.repeat, format);
    Ok(SUCCESS)
}
