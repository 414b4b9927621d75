use std::str::FromStr;

use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use vcz_content::{
    check,
    config::Config,
    content::{
        storage::{DiskStorage, Storage},
        Content,
    },
};

use args::Args;
use error::Error;
use manifest::Manifest;

mod args;
mod error;
mod manifest;

fn main() -> Result<(), Error> {
    let args = Args::parse();
    let mut config = Config::load()?;

    // cli flags override the file.
    if let Some(download_dir) = args.download_dir {
        config.download_dir = download_dir;
    }
    if args.allocate {
        config.allocate = true;
    }

    let level = match args.verbose {
        0 => Level::from_str(&config.log_level).unwrap_or(Level::INFO),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber =
        FmtSubscriber::builder().with_max_level(level).without_time().finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let manifest =
        Manifest::from_toml(&std::fs::read_to_string(&args.manifest)?)?;

    let mut content = manifest.content(DiskStorage, &config.download_dir)?;
    content.set_allocate(config.allocate);
    content.open()?;

    if !content.is_correct_size()? {
        warn!("some files do not have their declared size");
    }

    let marked = check::recheck(&mut content)?;
    info!("{marked} of {} chunks are complete", content.chunk_total());

    print!("{}", report(&content));

    content.close();

    Ok(())
}

/// One line for each file and one for the whole torrent, with the
/// percentage of complete chunks.
fn report<S: Storage>(content: &Content<S>) -> String {
    let mut out = String::new();

    for file in content.files() {
        let chunks = file.range().len() as u32;
        out.push_str(&format!(
            "{:>6.2}% {}/{} {}\n",
            percent(file.completed(), chunks),
            file.completed(),
            chunks,
            file.path().display()
        ));
    }

    out.push_str(&format!(
        "{:>6.2}% {}/{} total, {} of {} bytes\n",
        percent(content.completed_chunks(), content.chunk_total()),
        content.completed_chunks(),
        content.chunk_total(),
        content.bytes_completed(),
        content.total_size()
    ));

    out
}

fn percent(done: u32, total: u32) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 * 100.0 / total as f64
}
