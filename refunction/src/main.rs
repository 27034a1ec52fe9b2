fn main() {
    refunction::main()
}
