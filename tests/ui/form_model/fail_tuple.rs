#[derive(formix::form::FormModel)]
struct Coordinates(i64, i64);

fn main() {}
