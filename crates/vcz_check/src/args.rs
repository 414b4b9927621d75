use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Default)]
#[clap(name = "vczc", author = "Gabriel Lombardo")]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// TOML manifest of the torrent: its name, chunk size, hashes and files.
    pub manifest: PathBuf,

    /// The directory in which torrents are downloaded, the files are looked
    /// up under `<download_dir>/<name>`.
    #[clap(short, long)]
    pub download_dir: Option<PathBuf>,

    /// Resize every file to its declared size before checking.
    #[clap(short, long)]
    pub allocate: bool,

    /// Log more, can be repeated.
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
