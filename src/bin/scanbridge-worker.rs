//! Worker executable. Launched by the host with its own pid as the sole
//! argument; see `scanbridge::worker::worker_main`.

fn main() {
    scanbridge::worker::run_worker_main()
}
