//! The main entrypoint for treetar, which just performs global initialization, and then
//! calls out into the library.

use anyhow::Result;

async fn run() -> Result<()> {
    treetar_utils::initialize_tracing();
    tracing::trace!("starting");
    treetar_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
