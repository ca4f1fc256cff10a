use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use clap::Parser;
use log::info;
use pledge::{
    cancel::CancelToken,
    combinators::race,
    io::{self, Errno},
    task::Executor,
};

/// Read a file after a delay, with a timeout and an optional abort.
#[derive(Parser)]
struct Args {
    /// File to read.
    path: PathBuf,

    /// Delay before the file is opened.
    #[arg(long, default_value_t = 100)]
    delay_ms: u64,

    /// Give up if the whole pipeline takes longer than this.
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Abort the pipeline right after starting it.
    #[arg(long)]
    abort: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let token = CancelToken::new();

    let contents = {
        let (opener, reader) = (token.clone(), token.clone());
        let path = args.path.clone();

        io::sleep(&token, Duration::from_millis(args.delay_ms))
            .then(move |()| io::open(&opener, path).into_deferred())
            .then(move |file| io::read(&reader, &file, 0, 4096).into_deferred())
    };

    let timeout = io::sleep(&token, Duration::from_millis(args.timeout_ms))
        .then(|()| Err::<Vec<u8>, _>(Errno(libc::ETIMEDOUT)));

    let result = {
        let token = token.clone();
        race([contents, timeout]).finally(move || {
            token.cancel();
        })
    };

    if args.abort {
        info!("aborting");
        token.cancel();
    }

    let bytes = Executor::block_on(async move { result.await })?;
    println!("{}", String::from_utf8_lossy(&bytes));

    Ok(())
}
