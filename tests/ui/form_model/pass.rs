use formix::form::{FormController, FormModel, FormOptions};

#[derive(Clone, formix::form::FormModel)]
struct DemoForm {
    email: String,
    seats: i64,
}

fn main() {
    let fields = DemoForm::fields();
    assert_eq!(fields.email().key(), "email");

    let form = FormController::new(FormOptions::default());
    form.register_model(&DemoForm {
        email: "a@formix.dev".to_string(),
        seats: 2,
    })
    .expect("register model");
    form.set(&fields.seats(), 3).expect("set seats");

    let model = form.model::<DemoForm>().expect("read model");
    assert_eq!(model.email, "a@formix.dev");
    assert_eq!(model.seats, 3);
}
