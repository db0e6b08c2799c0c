//! The invoker: request a launch from a warm booster.

use std::process;
use std::thread;
use std::time::Duration;

use clap::Parser;

use prewarm::config::LauncherConfig;
use prewarm::invoker::{Invocation, InvokerArgs};

fn main() {
    let args = match InvokerArgs::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            process::exit(1);
        }
        Err(e) => {
            // --help / --version
            let _ = e.print();
            process::exit(0);
        }
    };

    if args.creds {
        // The credential subsystem is compiled out.
        println!("Security credential information isn't available.");
        return;
    }

    let invocation = match Invocation::from_args(&args) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("prewarm: {e}");
            process::exit(1);
        }
    };

    let config = LauncherConfig::load();
    let mut client = match invocation.run(&config.socket_dir) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("prewarm: {e:#}");
            process::exit(1);
        }
    };

    if !invocation.no_wait {
        client.wait_for_exit();
    }

    if args.delay > 0 {
        // Bus-activated services can misbehave if the invoker vanishes
        // immediately after the hand-off.
        thread::sleep(Duration::from_secs(args.delay));
    }
}
