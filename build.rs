use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    // Stamp the build so QUERY_VERSION can report when this binary was made.
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=BUILD_EPOCH_SECS={}", secs);
}
