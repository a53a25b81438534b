//! Records the target triple and cargo profile shown by `casrv version --extended`.

const EXPORTED: [(&str, &str); 2] = [
    ("TARGET", "CASRV_BUILD_TARGET"),
    ("PROFILE", "CASRV_BUILD_PROFILE"),
];

fn main() {
    for (source, exported) in EXPORTED {
        if let Ok(value) = std::env::var(source) {
            println!("cargo:rustc-env={exported}={value}");
        }
        println!("cargo:rerun-if-env-changed={source}");
    }
}
