use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use instrlink_kit::{LoopMode, LoopSpec, StopSignal, StreamRun};
use tracing::info;

use crate::cmd::{load_kit, CaptureArgs};
use crate::exit::{io_error, kit_error, CliError, CliResult, DATA_INVALID, INTERNAL, SUCCESS};
use crate::output::{print_capture, OutputFormat};

pub fn run(args: CaptureArgs, config: Option<&Path>, format: OutputFormat) -> CliResult<i32> {
    if args.block_size == 0 {
        return Err(CliError::new(DATA_INVALID, "block size must be positive"));
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.output)
        .map_err(|err| io_error(&format!("open {}", args.output.display()), err))?;

    let mut kit = load_kit(config)?;
    let started = match args.target.as_deref() {
        Some(target) => kit.start_stream_at(target),
        None => kit.start_stream(),
    };
    started.map_err(|err| kit_error("start stream interface", err))?;

    let buffer = kit
        .alloc_buffer(args.block_size)
        .map_err(|err| kit_error("buffer allocation failed", err))?;

    let stop = StopSignal::new();
    install_ctrlc_handler(stop.clone())?;

    // The hook cannot return an I/O error through the loop, so it parks
    // the first one here and stops the loop.
    let write_failure: Arc<Mutex<Option<std::io::Error>>> = Arc::new(Mutex::new(None));
    let failure_slot = Arc::clone(&write_failure);
    let hook_stop = stop.clone();
    let mut out = BufWriter::new(file);

    let mut spec = LoopSpec::new(args.channel, buffer, args.block_size).on_block(move |block| {
        let data = block.data()?;
        let written = out.write_all(&data).and_then(|()| out.flush());
        if let Err(err) = written {
            if let Ok(mut slot) = failure_slot.lock() {
                if slot.is_none() {
                    *slot = Some(err);
                }
            }
            hook_stop.raise();
        }
        Ok(())
    });
    if let Some(count) = args.count {
        spec = spec.max_transfers(count);
    }
    spec.options.poll_interval = kit.config().streaming.poll_interval();

    info!(channel = args.channel, output = %args.output.display(), "capture started");
    let run = kit
        .stream_recv(spec, stop, LoopMode::Blocking)
        .map_err(|err| kit_error("capture failed", err))?;

    if let Some(err) = write_failure.lock().ok().and_then(|mut slot| slot.take()) {
        return Err(io_error(&format!("write {}", args.output.display()), err));
    }
    let StreamRun::Finished(summary) = run else {
        return Err(CliError::new(INTERNAL, "capture did not run in the foreground"));
    };
    print_capture(args.channel, &summary, format);

    kit.stop_stream()
        .map_err(|err| kit_error("stop stream interface", err))?;
    Ok(SUCCESS)
}

fn install_ctrlc_handler(stop: StopSignal) -> CliResult<()> {
    ctrlc::set_handler(move || stop.raise()).map_err(|err| {
        CliError::new(INTERNAL, format!("signal handler setup failed: {err}"))
    })
}
