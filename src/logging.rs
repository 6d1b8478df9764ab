use tracing::Level;
use tracing_subscriber::FmtSubscriber;

pub(crate) fn max_level(verbose: bool) -> Level {
    if verbose { Level::DEBUG } else { Level::WARN }
}

/// Installs the global subscriber on stderr, leaving stdout to streamed model output. A second
/// call leaves the first one in place.
pub(crate) fn init(verbose: bool) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(max_level(verbose))
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_the_level() {
        assert_eq!(max_level(false), Level::WARN);
        assert_eq!(max_level(true), Level::DEBUG);
    }

    #[test]
    fn init_is_idempotent() {
        init(false);
        init(true);
        tracing::warn!("still logging after a second init");
    }
}
