//! Post handlers from the main thread and drain them with the reactor.

use sirocco::IoContext;

fn main() {
    let io = IoContext::new().expect("create io context");

    for i in 0..10 {
        io.post(move || println!("posted: {i}")).expect("post");
    }

    io.run_pending().expect("run pending");
}
