use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use std::sync::OnceLock;

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static QUESTS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static SALVO_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static RCACHE_HITS: OnceLock<IntCounter> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn counter(slot: &'static OnceLock<IntCounter>, name: &str, help: &str) -> &'static IntCounter {
    slot.get_or_init(|| {
        let counter = IntCounter::new(name, help).expect("counter options are valid");
        registry()
            .register(Box::new(counter.clone()))
            .expect("counter is registered once");
        counter
    })
}

pub fn quests_total() -> &'static IntCounter {
    counter(&QUESTS_TOTAL, "xiproxy_quests_total", "Quests dispatched")
}

pub fn salvo_total() -> &'static IntCounter {
    counter(&SALVO_TOTAL, "xiproxy_salvo_total", "Salvo fan-outs served")
}

pub fn rcache_hits() -> &'static IntCounter {
    counter(&RCACHE_HITS, "xiproxy_rcache_hits_total", "Answer cache hits")
}

/// Text-format dump of all registered series.
pub fn render() -> String {
    let mut buf = Vec::new();
    if TextEncoder::new()
        .encode(&registry().gather(), &mut buf)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
