fn main() -> shadow_rs::SdResult<()> {
    // Lets the default volume identifier be baked in at build time.
    println!("cargo:rerun-if-env-changed=CRYPTINIT_DEFAULT_VOLUME");
    shadow_rs::new()
}
