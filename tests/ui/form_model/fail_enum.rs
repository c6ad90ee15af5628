#[derive(formix::form::FormModel)]
enum Plan {
    Free,
    Team { seats: i64 },
}

fn main() {}
