//! Build script for netrecon
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! reported by `netrecon version`.

fn main() {
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
