use refpool::{explore, init_tracing, ExploreConfig};

fn main() -> eyre::Result<()> {
    init_tracing();
    let config = ExploreConfig::from_args(std::env::args().skip(1))?;
    let summary = explore(&config)?;
    print!("{}", summary);
    Ok(())
}
