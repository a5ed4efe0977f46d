use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Faults on a null write so `wraithwalk`'s signal shim has a real crash to
/// walk: `a` and `b` should show up as resolved parameters, `c` as a local.
#[inline(never)]
fn f(a: i32, b: i32) -> i32 {
    let c = a + b;
    unsafe {
        let p = core::ptr::null_mut::<i32>();
        core::ptr::write_volatile(p, c);
    }
    c
}

fn main() {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::INFO.into())
            .from_env()
            .unwrap(),
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    // SAFETY: called once, before any other thread can fault.
    unsafe {
        wraithwalk::install_handlers();
    }

    f(3, 4);
}
