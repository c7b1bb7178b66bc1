use tripwire_core::control::apply_control;
use tripwire_core::registrar::MockRegistrar;
use tripwire_core::tracker::CoverageTracker;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<(), anyhow::Error> {
    let registrar = Arc::new(MockRegistrar::new());
    let tracker = CoverageTracker::new(registrar.clone());
    registrar.attach_sink(tracker.fire_sink());

    println!("Adding probes: one base-program target, one for a module that is not loaded yet...");
    apply_control(&tracker, b"4a0\nmymod:10\n");
    println!("After control write: {:?}", tracker.stats());

    println!("Loading 'mymod' at base 0x1000...");
    tracker.on_module_arriving("mymod", 0x1000);
    println!("After module arrival: {:?}", tracker.stats());

    println!("Simulating execution over all armed addresses...");
    for address in registrar.armed_addresses() {
        registrar.execute(address);
    }

    let token = tracker.cancel_token();
    let stopper = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            token.cancel();
        })
    };

    let mut hits = 0;
    while let Some(hit) = tracker.take_next(&token) {
        print!("{}", hit.render());
        hits += 1;
    }
    stopper.join().expect("stopper thread panicked");

    println!("Drained {} hits. Final state: {:?}", hits, tracker.stats());
    Ok(())
}
