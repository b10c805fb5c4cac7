fn main() {
    strata::main();
}
