fn main() {
    switchyard::run()
}
