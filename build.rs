fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // ESP-IDF builds need the sysenv exported to the linker; host builds
    // (tests, simulation) have nothing to generate.
    #[cfg(feature = "espidf")]
    embuild::espidf::sysenv::output();
}
