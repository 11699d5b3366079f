use chrono::Utc;

fn main() {
    println!("cargo:rustc-env=BUILD_TIME={}", Utc::now().to_rfc2822());
}
