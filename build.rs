fn main() {
    // Propagates the ESP-IDF cfg/link args when building for an espidf target;
    // a no-op for host builds.
    embuild::espidf::sysenv::output();
}
