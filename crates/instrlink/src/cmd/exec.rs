use std::path::Path;

use crate::cmd::{command_kit, ExecArgs};
use crate::exit::{io_error, kit_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_exec, OutputFormat};

pub fn run(args: ExecArgs, config: Option<&Path>, format: OutputFormat) -> CliResult<i32> {
    let assignments = args
        .set
        .iter()
        .map(String::as_str)
        .map(parse_assignment)
        .collect::<CliResult<Vec<_>>>()?;
    let payload = match &args.payload {
        Some(path) => std::fs::read(path)
            .map_err(|err| io_error(&format!("read payload {}", path.display()), err))?,
        None => Vec::new(),
    };

    let kit = command_kit(config, args.target.as_deref())?;
    for (name, value) in assignments {
        kit.set_param(name, value)
            .map_err(|err| kit_error(&format!("set {name} failed"), err))?;
    }

    let context = format!("exec {} failed", args.command);
    let ran = if args.payload.is_some() {
        kit.execute_with(&args.command, &payload)
            .map_err(|err| kit_error(&context, err))?;
        vec![args.command.clone()]
    } else {
        kit.execute_for(&args.command)
            .map_err(|err| kit_error(&context, err))?
    };
    let params = kit.params().map_err(|err| kit_error(&context, err))?;
    print_exec(&ran, &params, format);
    Ok(SUCCESS)
}

fn parse_assignment(pair: &str) -> CliResult<(&str, &str)> {
    pair.split_once('=')
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| CliError::new(USAGE, format!("expected NAME=VALUE, got {pair:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignments_split_on_first_equals() {
        assert_eq!(parse_assignment("freq=1e9").unwrap(), ("freq", "1e9"));
        assert_eq!(parse_assignment("path=a=b").unwrap(), ("path", "a=b"));
        assert_eq!(parse_assignment("freq").unwrap_err().code, USAGE);
        assert_eq!(parse_assignment("=5").unwrap_err().code, USAGE);
    }
}
