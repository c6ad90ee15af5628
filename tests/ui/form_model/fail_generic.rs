#[derive(formix::form::FormModel)]
struct Draft<T> {
    value: T,
}

fn main() {}
