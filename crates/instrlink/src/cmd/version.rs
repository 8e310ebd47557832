use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("instrlink {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: instrlink");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "build_target: {}",
        option_env!("INSTRLINK_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!("features: serial={}, cli=true", cfg!(feature = "serial"));
    println!("transports: {}", transports().join(", "));

    Ok(SUCCESS)
}

fn transports() -> Vec<String> {
    let registry = instrlink_kit::TransportRegistry::with_builtins();
    let mut names: Vec<String> = registry
        .command_names()
        .into_iter()
        .chain(registry.stream_names())
        .map(str::to_string)
        .collect();
    names.sort();
    names.dedup();
    names
}
