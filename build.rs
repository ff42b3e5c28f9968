fn main() {
    // Emits built.rs with GIT_COMMIT_HASH and friends into OUT_DIR.
    if let Err(err) = built::write_built_file() {
        println!("cargo:warning=failed to acquire build-time information: {err}");
    }
}
