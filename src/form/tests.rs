use super::*;
use futures::executor::block_on;
use futures_timer::Delay;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, FormModel)]
struct SignupForm {
    email: String,
    age: i64,
    newsletter: bool,
    tags: Vec<String>,
}

fn base_signup() -> SignupForm {
    SignupForm {
        email: "user@example.com".to_string(),
        age: 30,
        newsletter: false,
        tags: vec!["a".to_string()],
    }
}

fn required(value: &String) -> Result<(), String> {
    if value.is_empty() {
        Err("Required".to_string())
    } else {
        Ok(())
    }
}

fn text(key: &str) -> Field<String> {
    Field::new(key)
}

fn record_changes(
    form: &FormController,
    scope: SubscriptionScope,
) -> Arc<Mutex<Vec<ChangeKind>>> {
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    form.subscribe(scope, move |change: &FormChange| {
        sink.lock().expect("change log lock").push(change.kind);
    })
    .expect("subscribe");
    changes
}

fn change_count(changes: &Arc<Mutex<Vec<ChangeKind>>>) -> usize {
    changes.lock().expect("change log lock").len()
}

#[test]
fn set_tracks_value_and_dirty_state() {
    let form = FormController::new(FormOptions::default());
    let name = text("name");
    form.register(FieldDefinition::builder(&name).initial("Ada".to_string()))
        .expect("register name");

    assert_eq!(form.value(&name).expect("read name"), "Ada");
    assert!(!form.snapshot().expect("snapshot").is_dirty("name"));

    let changed = form.set(&name, "Grace".to_string()).expect("set name");
    assert_eq!(changed, vec![name.id().clone()]);
    assert!(form.snapshot().expect("snapshot").is_dirty("name"));

    form.set(&name, "Ada".to_string()).expect("set back");
    let snapshot = form.snapshot().expect("snapshot");
    assert!(!snapshot.is_dirty("name"));
    assert!(!snapshot.is_form_dirty());
}

#[test]
fn setting_the_same_value_is_a_no_op() {
    let form = FormController::new(FormOptions::default());
    let name = text("name");
    form.register(FieldDefinition::builder(&name).initial("Ada".to_string()))
        .expect("register name");
    let changes = record_changes(&form, SubscriptionScope::Form);
    let version = form.snapshot().expect("snapshot").version();

    let changed = form.set(&name, "Ada".to_string()).expect("set same value");
    assert!(changed.is_empty());
    assert_eq!(form.snapshot().expect("snapshot").version(), version);
    assert_eq!(change_count(&changes), 0);
    assert!(!form.can_undo().expect("history"));
}

#[test]
fn unknown_fields_read_as_zero_unless_strict() {
    let ghost = FieldId::new("ghost", FieldKind::Integer);

    let lenient = FormController::new(FormOptions::default());
    assert_eq!(
        lenient.value_of(&ghost).expect("zero value"),
        FieldValue::Integer(0)
    );

    let strict = FormController::new(FormOptions {
        strict: true,
        ..FormOptions::default()
    });
    assert_eq!(
        strict.value_of(&ghost),
        Err(FormError::UnknownField("ghost".to_string()))
    );
    assert_eq!(
        strict.set_value(&ghost, FieldValue::Integer(1)),
        Err(FormError::UnknownField("ghost".to_string()))
    );
}

#[test]
fn value_of_another_kind_is_rejected() {
    let form = FormController::new(FormOptions::default());
    let age = Field::<i64>::new("age");
    form.register(FieldDefinition::builder(&age)).expect("register age");

    let error = form
        .set_value(&age, FieldValue::from("thirty"))
        .expect_err("text into integer field");
    assert!(matches!(error, FormError::ValueKindMismatch { .. }));
    assert_eq!(form.value(&age).expect("read age"), 0);
}

#[test]
fn registering_a_key_with_another_kind_fails() {
    let form = FormController::new(FormOptions::default());
    form.register(FieldDefinition::builder(&text("age")))
        .expect("register text age");

    let error = form
        .register(FieldDefinition::builder(&Field::<i64>::new("age")))
        .expect_err("kind mismatch");
    assert!(matches!(
        error,
        FormError::Configuration(ConfigurationError::KindMismatch { .. })
    ));
    assert_eq!(
        form.kind_of("age").expect("kind lookup"),
        Some(FieldKind::Text)
    );
}

#[test]
fn dependency_cycle_is_rejected_at_registration() {
    let form = FormController::new(FormOptions::default());
    let a = text("a");
    let b = text("b");
    form.register(FieldDefinition::builder(&a).depends_on(&b))
        .expect("register a");

    let error = form
        .register(FieldDefinition::builder(&b).depends_on(&a))
        .expect_err("cycle must be rejected");
    let FormError::Configuration(ConfigurationError::DependencyCycle { cycle }) = &error else {
        panic!("unexpected error {error:?}");
    };
    assert!(cycle.contains(&"a".to_string()));
    assert!(cycle.contains(&"b".to_string()));
    assert!(error.to_string().starts_with("dependency cycle:"));
    assert!(!form.is_registered(&b).expect("registration lookup"));
}

#[test]
fn preserved_value_wins_over_new_initial_value() {
    let form = FormController::new(FormOptions::default());
    let name = text("name");
    form.register(FieldDefinition::builder(&name).initial("A".to_string()))
        .expect("register");
    form.set(&name, "B".to_string()).expect("set");

    assert!(form.unregister(&name, true).expect("unregister"));
    assert!(!form.is_registered(&name).expect("lookup"));
    assert_eq!(form.value(&name).expect("preserved value"), "B");

    form.register(FieldDefinition::builder(&name).initial("C".to_string()))
        .expect("register again");
    assert_eq!(form.value(&name).expect("value"), "B");
    assert!(form.snapshot().expect("snapshot").is_dirty("name"));

    assert!(form.unregister(&name, false).expect("unregister"));
    assert_eq!(form.kind_of("name").expect("kind lookup"), None);
    assert_eq!(form.snapshot().expect("snapshot").value("name"), None);
}

#[test]
fn reset_restores_everything_in_one_notification() {
    let form = FormController::new(FormOptions::default());
    let email = text("email");
    let age = Field::<i64>::new("age");
    form.register(
        FieldDefinition::builder(&email)
            .initial("a@b.c".to_string())
            .validator(required),
    )
    .expect("register email");
    form.register(FieldDefinition::builder(&age).initial(18))
        .expect("register age");

    form.set(&email, String::new()).expect("clear email");
    form.set(&age, 40).expect("set age");
    form.touch(&email).expect("touch");
    assert_eq!(form.snapshot().expect("snapshot").error("email"), Some("Required"));

    let changes = record_changes(&form, SubscriptionScope::Form);
    form.reset().expect("reset");

    assert_eq!(
        *changes.lock().expect("change log lock"),
        vec![ChangeKind::Reset]
    );
    let snapshot = form.snapshot().expect("snapshot");
    assert_eq!(snapshot.get(&email).as_deref(), Some("a@b.c"));
    assert_eq!(snapshot.get(&age), Some(18));
    assert!(!snapshot.is_form_dirty());
    assert!(!snapshot.is_touched("email"));
    assert!(snapshot.is_valid());
    assert_eq!(snapshot.submit_state(), SubmitState::Idle);
}

#[test]
fn reset_field_only_touches_that_field() {
    let form = FormController::new(FormOptions::default());
    let first = text("first");
    let last = text("last");
    form.register(FieldDefinition::builder(&first)).expect("register first");
    form.register(FieldDefinition::builder(&last)).expect("register last");
    form.set(&first, "Ada".to_string()).expect("set first");
    form.set(&last, "Lovelace".to_string()).expect("set last");

    form.reset_field(&first).expect("reset first");
    let snapshot = form.snapshot().expect("snapshot");
    assert_eq!(snapshot.get(&first).as_deref(), Some(""));
    assert_eq!(snapshot.get(&last).as_deref(), Some("Lovelace"));
    assert!(!snapshot.is_dirty("first"));
    assert!(snapshot.is_dirty("last"));
}

#[test]
fn reset_initial_values_adopts_current_values() {
    let form = FormController::new(FormOptions::default());
    let name = text("name");
    form.register(FieldDefinition::builder(&name)).expect("register");
    form.set(&name, "Ada".to_string()).expect("set");

    form.reset_initial_values().expect("reset initial values");
    assert!(!form.snapshot().expect("snapshot").is_form_dirty());
    assert!(!form.can_undo().expect("history"));

    form.set(&name, "Grace".to_string()).expect("set");
    form.reset().expect("reset");
    assert_eq!(form.value(&name).expect("value"), "Ada");

    form.reset_to_values([(name.id().clone(), FieldValue::from("Linus"))])
        .expect("reset to values");
    assert_eq!(form.value(&name).expect("value"), "Linus");
    assert!(!form.snapshot().expect("snapshot").is_dirty("name"));
}

#[test]
fn undo_and_redo_walk_the_history() {
    let form = FormController::new(FormOptions::default());
    let name = text("name");
    form.register(FieldDefinition::builder(&name)).expect("register");
    for value in ["a", "ab", "abc"] {
        form.set(&name, value.to_string()).expect("set");
    }

    assert_eq!(form.undo().expect("undo").get(&name).as_deref(), Some("ab"));
    assert_eq!(form.undo().expect("undo").get(&name).as_deref(), Some("a"));
    assert_eq!(form.redo().expect("redo").get(&name).as_deref(), Some("ab"));
    assert!(form.can_redo().expect("history"));

    form.set(&name, "x".to_string()).expect("set");
    assert!(!form.can_redo().expect("history"));

    for _ in 0..5 {
        form.undo().expect("undo");
    }
    let snapshot = form.snapshot().expect("snapshot");
    assert_eq!(snapshot.get(&name).as_deref(), Some(""));
    assert!(!snapshot.is_dirty("name"));
    assert!(!form.can_undo().expect("history"));
}

#[test]
fn history_limit_bounds_undo_depth() {
    let form = FormController::new(FormOptions {
        history_limit: 2,
        ..FormOptions::default()
    });
    let count = Field::<i64>::new("count");
    form.register(FieldDefinition::builder(&count)).expect("register");
    for value in 1..=5 {
        form.set(&count, value).expect("set");
    }
    assert_eq!(form.undo().expect("undo").get(&count), Some(4));
    assert_eq!(form.undo().expect("undo").get(&count), Some(0));
    assert!(!form.can_undo().expect("history"));
}

#[test]
fn apply_batch_is_one_history_entry_and_one_notification() {
    let form = FormController::new(FormOptions::default());
    let a = Field::<i64>::new("a");
    let b = Field::<i64>::new("b");
    form.register(FieldDefinition::builder(&a)).expect("register a");
    form.register(FieldDefinition::builder(&b)).expect("register b");
    let changes = record_changes(&form, SubscriptionScope::Form);

    let changed = form
        .apply_batch([
            (a.id().clone(), FieldValue::Integer(1)),
            (b.id().clone(), FieldValue::Integer(2)),
        ])
        .expect("batch");
    assert_eq!(changed.len(), 2);
    assert_eq!(change_count(&changes), 1);

    let snapshot = form.undo().expect("undo");
    assert_eq!(snapshot.get(&a), Some(0));
    assert_eq!(snapshot.get(&b), Some(0));
}

#[test]
fn rejected_batch_writes_nothing() {
    let form = FormController::new(FormOptions::default());
    let a = Field::<i64>::new("a");
    form.register(FieldDefinition::builder(&a)).expect("register a");

    let result = form.apply_batch([
        (a.id().clone(), FieldValue::Integer(1)),
        (a.id().clone(), FieldValue::from("oops")),
    ]);
    assert!(result.is_err());
    assert_eq!(form.value(&a).expect("value"), 0);
}

#[test]
fn cross_field_validator_reruns_when_dependency_changes() {
    let form = FormController::new(FormOptions::default());
    let password = text("password");
    let confirm = text("confirm");
    form.register(FieldDefinition::builder(&password))
        .expect("register password");
    let source = password.clone();
    form.register(
        FieldDefinition::builder(&confirm)
            .depends_on(&password)
            .cross_field(move |value: &String, state: &FormState| {
                if state.get(&source).as_deref() == Some(value.as_str()) {
                    Ok(())
                } else {
                    Err("Passwords do not match".to_string())
                }
            }),
    )
    .expect("register confirm");

    form.set(&password, "secret".to_string()).expect("set password");
    form.set(&confirm, "secret".to_string()).expect("set confirm");
    assert!(form.validation(&confirm).expect("validation").is_valid);

    let confirm_changes = record_changes(&form, SubscriptionScope::Field(confirm.id().clone()));
    let changed = form.set(&password, "other".to_string()).expect("set password");
    assert_eq!(changed, vec![password.id().clone()]);
    assert_eq!(change_count(&confirm_changes), 1);
    assert_eq!(
        form.validation(&confirm).expect("validation").error_message.as_deref(),
        Some("Passwords do not match")
    );
}

#[test]
fn added_cross_field_validator_joins_the_graph() {
    let form = FormController::new(FormOptions::default());
    let start = Field::<i64>::new("start");
    let end = Field::<i64>::new("end");
    form.register(FieldDefinition::builder(&start)).expect("register start");
    form.register(FieldDefinition::builder(&end).initial(10))
        .expect("register end");
    let source = start.clone();
    form.add_cross_field_validator(
        &end,
        &[start.id().clone()],
        move |value: &i64, state: &FormState| {
            if state.get(&source).unwrap_or_default() <= *value {
                Ok(())
            } else {
                Err("End must follow start".to_string())
            }
        },
    )
    .expect("add validator");

    form.set(&start, 20).expect("set start");
    assert_eq!(
        form.snapshot().expect("snapshot").error("end"),
        Some("End must follow start")
    );
}

#[test]
fn on_blur_validation_waits_for_touch() {
    let form = FormController::new(FormOptions {
        validate_mode: ValidationMode::OnBlur,
        ..FormOptions::default()
    });
    let email = text("email");
    form.register(
        FieldDefinition::builder(&email)
            .initial("x".to_string())
            .validator(required),
    )
    .expect("register");

    form.set(&email, String::new()).expect("set");
    assert!(form.validation(&email).expect("validation").is_valid);

    form.touch(&email).expect("touch");
    let snapshot = form.snapshot().expect("snapshot");
    assert!(snapshot.is_touched("email"));
    assert_eq!(snapshot.error("email"), Some("Required"));
}

#[test]
fn validator_panic_is_reported_as_failure() {
    let form = FormController::new(FormOptions::default());
    let name = text("name");
    form.register(
        FieldDefinition::builder(&name)
            .validator(|_value: &String| -> Result<(), String> { panic!("validator bug") }),
    )
    .expect("register");

    form.set(&name, "x".to_string()).expect("set survives panic");
    let result = form.validation(&name).expect("validation");
    assert!(!result.is_valid);
    assert_eq!(result.error_message.as_deref(), Some(VALIDATION_FAILED));
}

#[test]
fn stale_async_validation_result_is_discarded() {
    let form = FormController::new(FormOptions::default());
    let zip = text("zip");
    form.register(FieldDefinition::builder(&zip).async_validator(|value: String| async move {
        if value.len() < 5 {
            Delay::new(Duration::from_millis(200)).await;
            Err("Invalid zip".to_string())
        } else {
            Delay::new(Duration::from_millis(20)).await;
            Ok(())
        }
    }))
    .expect("register zip");

    form.set(&zip, "9".to_string()).expect("set partial zip");
    assert!(form.snapshot().expect("snapshot").is_pending("zip"));

    block_on(async {
        let slow = form.validate_async(&zip);
        let fast = async {
            Delay::new(Duration::from_millis(100)).await;
            form.set(&zip, "90210".to_string()).expect("set full zip");
            form.validate_async(&zip).await
        };
        let (slow, fast) = futures::join!(slow, fast);
        slow.expect("slow validation");
        assert!(fast.expect("fast validation").is_valid);
    });

    let result = form.validation(&zip).expect("validation");
    assert!(result.is_valid);
    assert_eq!(result.error_message, None);
    assert!(!result.is_validating);
    assert!(!form.snapshot().expect("snapshot").is_pending("zip"));
}

#[test]
fn debounced_async_validator_only_runs_latest_value() {
    let form = FormController::new(FormOptions::default());
    let email = text("email");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    form.register(FieldDefinition::builder(&email).async_validator_with_debounce(
        30,
        move |value: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if value.contains("bad") {
                    Err("Rejected".to_string())
                } else {
                    Ok(())
                }
            }
        },
    ))
    .expect("register");

    form.set(&email, "bad@example.com".to_string()).expect("first set");
    block_on(async {
        let first = form.validate_async(&email);
        let second = async {
            Delay::new(Duration::from_millis(5)).await;
            form.set(&email, "good@example.com".to_string())
                .expect("second set");
            form.validate_async(&email).await
        };
        let (first, second) = futures::join!(first, second);
        first.expect("first validation");
        second.expect("second validation");
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(form.validation(&email).expect("validation").is_valid);
    assert_eq!(form.value(&email).expect("value"), "good@example.com");
}

#[test]
fn validate_form_async_awaits_async_validators() {
    let form = FormController::new(FormOptions {
        validate_mode: ValidationMode::OnSubmit,
        ..FormOptions::default()
    });
    let handle = text("handle");
    form.register(
        FieldDefinition::builder(&handle)
            .initial("taken".to_string())
            .async_validator(|value: String| async move {
                if value == "taken" {
                    Err("Handle is taken".to_string())
                } else {
                    Ok(())
                }
            }),
    )
    .expect("register");
    assert!(form.queued_async().expect("queue").is_empty());

    let valid = block_on(form.validate_form_async()).expect("validate async");
    assert!(!valid);
    assert_eq!(
        form.snapshot().expect("snapshot").error("handle"),
        Some("Handle is taken")
    );

    form.set(&handle, "free".to_string()).expect("set");
    assert!(block_on(form.validate_form_async()).expect("validate async"));
}

#[test]
fn derived_total_follows_its_sources() {
    let form = FormController::new(FormOptions::default());
    let price = Field::<Decimal>::new("price");
    let quantity = Field::<i64>::new("quantity");
    let total = Field::<Decimal>::new("total");
    form.register(FieldDefinition::builder(&price).initial(Decimal::from(10_i64)))
        .expect("register price");
    form.register(FieldDefinition::builder(&quantity).initial(3))
        .expect("register quantity");
    form.add_derivation(Derivation::new(
        &total,
        [price.id(), quantity.id()],
        |values: &[FieldValue]| {
            let price = values[0].as_decimal().unwrap_or_default();
            let quantity = values[1].as_decimal().unwrap_or_default();
            price * quantity
        },
    ))
    .expect("add derivation");

    assert_eq!(form.value(&total).expect("total"), Decimal::from(30_i64));
    assert!(!form.snapshot().expect("snapshot").is_dirty("total"));

    let changed = form.set(&quantity, 5).expect("set quantity");
    assert_eq!(changed, vec![quantity.id().clone(), total.id().clone()]);
    assert_eq!(form.value(&total).expect("total"), Decimal::from(50_i64));
    assert!(form.snapshot().expect("snapshot").is_dirty("total"));

    let snapshot = form.undo().expect("undo");
    assert_eq!(snapshot.get(&total), Some(Decimal::from(30_i64)));
}

#[test]
fn duplicate_or_cyclic_derivations_are_rejected() {
    let form = FormController::new(FormOptions::default());
    let a = Field::<i64>::new("a");
    let b = Field::<i64>::new("b");
    form.add_derivation(Derivation::new(&b, [a.id()], |values: &[FieldValue]| {
        values[0].as_integer().unwrap_or_default() + 1
    }))
    .expect("b from a");

    let duplicate = form.add_derivation(Derivation::new(&b, [a.id()], |_: &[FieldValue]| 0_i64));
    assert_eq!(
        duplicate,
        Err(FormError::Configuration(ConfigurationError::DuplicateDerivation(
            "b".to_string()
        )))
    );

    let cycle = form.add_derivation(Derivation::new(&a, [b.id()], |_: &[FieldValue]| 0_i64));
    assert!(matches!(
        cycle,
        Err(FormError::Configuration(ConfigurationError::DependencyCycle { .. }))
    ));
    assert_eq!(form.derivation_targets().expect("targets"), vec![b.id().clone()]);
}

#[test]
fn projector_skips_unrelated_source_changes() {
    let form = FormController::new(FormOptions::default());
    let user = text("user");
    let city = text("city");
    form.register(FieldDefinition::builder(&user).initial("Ada|Paris".to_string()))
        .expect("register user");

    fn city_of(values: &[FieldValue]) -> String {
        values[0]
            .as_text()
            .and_then(|value| value.split('|').nth(1))
            .unwrap_or_default()
            .to_string()
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    form.add_derivation(
        Derivation::new(&city, [user.id()], move |values: &[FieldValue]| {
            counter.fetch_add(1, Ordering::SeqCst);
            city_of(values).to_uppercase()
        })
        .select(|values: &[FieldValue]| FieldValue::Text(city_of(values))),
    )
    .expect("add derivation");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    form.set(&user, "Bob|Paris".to_string()).expect("rename user");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    form.set(&user, "Bob|Rome".to_string()).expect("move user");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(form.value(&city).expect("city"), "ROME");
}

#[test]
fn projected_derivation_recomputes_after_undo() {
    let form = FormController::new(FormOptions::default());
    let price = Field::<i64>::new("price");
    let double = Field::<i64>::new("double");
    form.register(FieldDefinition::builder(&price).initial(1))
        .expect("register");
    form.add_derivation(
        Derivation::new(&double, [price.id()], |values: &[FieldValue]| {
            values[0].as_integer().unwrap_or_default() * 2
        })
        .select(|values: &[FieldValue]| values[0].clone()),
    )
    .expect("add derivation");

    form.set(&price, 5).expect("set price");
    assert_eq!(form.value(&double).expect("double"), 10);

    form.undo().expect("undo");
    assert_eq!(form.value(&price).expect("price"), 1);
    assert_eq!(form.value(&double).expect("double"), 2);

    form.set(&price, 5).expect("set price again");
    assert_eq!(form.value(&double).expect("double"), 10);

    form.apply_batch([
        (price.id().clone(), FieldValue::Integer(1)),
        (double.id().clone(), FieldValue::Integer(2)),
    ])
    .expect("batch writes source and target");
    form.set(&price, 5).expect("set price after batch");
    assert_eq!(form.value(&double).expect("double"), 10);
}

#[test]
fn panicking_derivation_keeps_previous_value() {
    let form = FormController::new(FormOptions::default());
    let count = Field::<i64>::new("count");
    let label = text("label");
    form.register(FieldDefinition::builder(&count).initial(1))
        .expect("register");
    form.add_derivation(Derivation::new(&label, [count.id()], |values: &[FieldValue]| {
        let count = values[0].as_integer().unwrap_or_default();
        assert!(count < 10, "count overflow");
        format!("{count} items")
    }))
    .expect("add derivation");

    form.set(&count, 42).expect("set survives panic");
    assert_eq!(form.value(&label).expect("label"), "1 items");
    assert_eq!(form.value(&count).expect("count"), 42);
}

#[test]
fn async_derivation_marks_target_pending_until_flushed() {
    let form = FormController::new(FormOptions::default());
    let title = text("title");
    let slug = text("slug");
    form.register(FieldDefinition::builder(&title)).expect("register");
    form.add_derivation(
        Derivation::new_async(&slug, [title.id()], |values: Vec<FieldValue>| async move {
            Delay::new(Duration::from_millis(5)).await;
            values[0].as_text().unwrap_or_default().to_lowercase()
        })
        .debounce(10),
    )
    .expect("add derivation");
    block_on(form.flush_async()).expect("initial flush");

    form.set(&title, "Hello".to_string()).expect("set title");
    assert!(form.snapshot().expect("snapshot").is_pending("slug"));
    assert_eq!(
        form.queued_async().expect("queue"),
        BTreeSet::from([slug.id().clone()])
    );

    block_on(form.flush_async()).expect("flush");
    let snapshot = form.snapshot().expect("snapshot");
    assert_eq!(snapshot.get(&slug).as_deref(), Some("hello"));
    assert!(!snapshot.is_pending("slug"));
}

#[test]
fn superseded_async_derivation_is_discarded() {
    let form = FormController::new(FormOptions::default());
    let title = text("title");
    let slug = text("slug");
    form.register(FieldDefinition::builder(&title)).expect("register");
    form.add_derivation(
        Derivation::new_async(&slug, [title.id()], |values: Vec<FieldValue>| async move {
            let title = values[0].as_text().unwrap_or_default().to_string();
            let latency = if title == "First" { 40 } else { 5 };
            Delay::new(Duration::from_millis(latency)).await;
            title.to_lowercase()
        })
        .debounce(0),
    )
    .expect("add derivation");
    block_on(form.flush_async()).expect("initial flush");

    form.set(&title, "First".to_string()).expect("set title");
    block_on(async {
        let older = form.derive_async(&slug);
        let newer = async {
            form.set(&title, "Second".to_string()).expect("retitle");
            form.derive_async(&slug).await
        };
        let (older, newer) = futures::join!(older, newer);
        older.expect("older derivation");
        newer.expect("newer derivation");
    });

    let snapshot = form.snapshot().expect("snapshot");
    assert_eq!(snapshot.get(&slug).as_deref(), Some("second"));
    assert!(!snapshot.is_pending("slug"));
    assert!(form.queued_async().expect("queue").is_empty());
}

#[test]
fn submit_state_transitions_are_enforced() {
    let form = FormController::new(FormOptions::default());
    let email = text("email");
    form.register(FieldDefinition::builder(&email).validator(required))
        .expect("register");

    let submit_count = Arc::new(AtomicUsize::new(0));
    {
        let submit_count = submit_count.clone();
        form.submit(move |_state| {
            submit_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("submit should return Ok when validation fails");
    }
    assert_eq!(submit_count.load(Ordering::SeqCst), 0);
    assert_eq!(
        form.snapshot().expect("snapshot").submit_state(),
        SubmitState::Failed
    );

    form.set(&email, "valid@example.com".to_string())
        .expect("set valid email");
    let mut nested = None;
    {
        let submit_count = submit_count.clone();
        let inner = form.clone();
        form.submit(|state| {
            assert!(state.is_submitting());
            nested = Some(inner.submit(|_| Ok(())));
            submit_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("submit should succeed");
    }
    assert_eq!(nested, Some(Err(FormError::AlreadySubmitting)));
    assert_eq!(submit_count.load(Ordering::SeqCst), 1);
    let snapshot = form.snapshot().expect("snapshot");
    assert_eq!(snapshot.submit_state(), SubmitState::Succeeded);
    assert_eq!(snapshot.submit_count(), 2);
}

#[test]
fn failing_submit_handler_marks_submit_failed() {
    let form = FormController::new(FormOptions::default());
    form.register(FieldDefinition::builder(&text("name")))
        .expect("register");

    let result = block_on(form.submit_async(|_state| async {
        Err(FormError::SubmitFailed("server unavailable".to_string()))
    }));
    assert_eq!(
        result,
        Err(FormError::SubmitFailed("server unavailable".to_string()))
    );
    assert_eq!(
        form.snapshot().expect("snapshot").submit_state(),
        SubmitState::Failed
    );
}

#[test]
fn draft_store_roundtrip_restores_and_clears() {
    let store = InMemoryDraftStore::new();
    let form_id = FormId::new("signup");
    let name = text("name");

    let form = FormController::new(FormOptions {
        form_id: Some(form_id.clone()),
        ..FormOptions::default()
    })
    .with_draft_store(store.clone());
    form.register(FieldDefinition::builder(&name)).expect("register");
    form.set(&name, "Ada".to_string()).expect("set");
    assert!(store.contains(&form_id));

    let restored = FormController::new(FormOptions {
        form_id: Some(form_id.clone()),
        ..FormOptions::default()
    })
    .with_draft_store(store.clone());
    restored
        .register(FieldDefinition::builder(&name))
        .expect("register");
    assert!(restored.restore_draft().expect("restore"));
    assert_eq!(restored.value(&name).expect("value"), "Ada");
    assert!(restored.snapshot().expect("snapshot").is_dirty("name"));
    assert!(!restored.can_undo().expect("history"));

    restored.submit(|_| Ok(())).expect("submit");
    assert!(!store.contains(&form_id));
    assert!(!restored.restore_draft().expect("nothing to restore"));
}

#[test]
fn analytics_reports_lifecycle_and_abandonment() {
    let log = AnalyticsLog::new();
    let form = FormController::new(FormOptions::default()).with_analytics(log.clone());
    let name = text("name");
    form.register(FieldDefinition::builder(&name)).expect("register");
    form.set(&name, "Ada".to_string()).expect("set");
    form.touch(&name).expect("touch");
    form.dispose().expect("dispose");

    assert_eq!(log.count(|event| *event == AnalyticsEvent::FormStarted), 1);
    assert_eq!(
        log.count(|event| matches!(event, AnalyticsEvent::FieldChanged { .. })),
        1
    );
    assert_eq!(
        log.count(|event| matches!(event, AnalyticsEvent::FieldTouched { .. })),
        1
    );
    assert_eq!(log.count(|event| *event == AnalyticsEvent::FormAbandoned), 1);

    let submitted_log = AnalyticsLog::new();
    let submitted =
        FormController::new(FormOptions::default()).with_analytics(submitted_log.clone());
    submitted
        .register(FieldDefinition::builder(&name))
        .expect("register");
    submitted.set(&name, "Ada".to_string()).expect("set");
    submitted.submit(|_| Ok(())).expect("submit");
    submitted.dispose().expect("dispose");
    assert_eq!(
        submitted_log.count(|event| *event == AnalyticsEvent::SubmitSuccess),
        1
    );
    assert_eq!(
        submitted_log.count(|event| *event == AnalyticsEvent::FormAbandoned),
        0
    );
}

#[test]
fn field_scoped_subscription_sees_only_its_field_and_resets() {
    let form = FormController::new(FormOptions::default());
    let a = text("a");
    let b = text("b");
    form.register(FieldDefinition::builder(&a)).expect("register a");
    form.register(FieldDefinition::builder(&b)).expect("register b");
    let changes = record_changes(&form, SubscriptionScope::Field(a.id().clone()));

    form.set(&b, "x".to_string()).expect("set b");
    assert_eq!(change_count(&changes), 0);
    form.set(&a, "x".to_string()).expect("set a");
    assert_eq!(change_count(&changes), 1);
    form.reset().expect("reset");
    assert_eq!(
        *changes.lock().expect("change log lock"),
        vec![ChangeKind::Values, ChangeKind::Reset]
    );
}

#[test]
fn observers_can_call_back_into_the_form() {
    let form = FormController::new(FormOptions::default());
    let source = text("source");
    let mirror = text("mirror");
    form.register(FieldDefinition::builder(&source)).expect("register");
    form.register(FieldDefinition::builder(&mirror)).expect("register");

    let inner = form.clone();
    let target = mirror.clone();
    let id = form
        .subscribe(SubscriptionScope::Field(source.id().clone()), move |change| {
            if let Some(value) = change.snapshot.get(&Field::<String>::new("source")) {
                inner.set(&target, value).expect("mirror write");
            }
        })
        .expect("subscribe");

    form.set(&source, "hello".to_string()).expect("set");
    assert_eq!(form.value(&mirror).expect("mirror"), "hello");

    assert!(form.unsubscribe(id).expect("unsubscribe"));
    assert!(!form.unsubscribe(id).expect("unsubscribe twice"));
}

#[test]
fn snapshots_are_immutable_versions() {
    let form = FormController::new(FormOptions::default());
    let name = text("name");
    form.register(FieldDefinition::builder(&name)).expect("register");
    let before = form.snapshot().expect("snapshot");
    form.set(&name, "Ada".to_string()).expect("set");
    let after = form.snapshot().expect("snapshot");

    assert_eq!(before.get(&name).as_deref(), Some(""));
    assert_eq!(after.get(&name).as_deref(), Some("Ada"));
    assert!(after.version() > before.version());
}

#[test]
fn two_hundred_fields_update_invokes_single_validator() {
    let form = FormController::new(FormOptions::default());
    let invoke_count = Arc::new(AtomicUsize::new(0));
    let fields = (0..200)
        .map(|index| text(&format!("field-{index}")))
        .collect::<Vec<_>>();
    for field in &fields {
        let counter = invoke_count.clone();
        form.register(FieldDefinition::builder(field).validator(
            move |_value: &String| -> Result<(), String> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ))
        .expect("register field");
    }

    form.set(&fields[137], "changed".to_string())
        .expect("update single field");
    assert_eq!(invoke_count.load(Ordering::SeqCst), 1);
    assert_eq!(form.registered_fields().expect("fields").len(), 200);
}

#[test]
fn steps_move_without_underflow() {
    let form = FormController::new(FormOptions::default());
    assert_eq!(form.previous_step().expect("previous"), 0);
    assert_eq!(form.next_step().expect("next"), 1);
    assert_eq!(form.next_step().expect("next"), 2);
    form.set_step(0).expect("set step");
    assert_eq!(form.snapshot().expect("snapshot").step(), 0);
}

#[test]
fn inspector_tracks_attached_forms() {
    let inspector = FormInspector::new();
    let first = FormController::new(FormOptions {
        form_id: Some(FormId::new("first")),
        ..FormOptions::default()
    });
    let second = FormController::new(FormOptions {
        form_id: Some(FormId::new("second")),
        ..FormOptions::default()
    });
    inspector.attach(&first).expect("attach first");
    inspector.attach(&second).expect("attach second");
    assert_eq!(
        inspector.forms().expect("forms"),
        vec![FormId::new("first"), FormId::new("second")]
    );

    first
        .register(FieldDefinition::builder(&text("name")))
        .expect("register");
    let snapshot = inspector
        .snapshot(&FormId::new("first"))
        .expect("snapshot")
        .expect("attached form");
    assert!(snapshot.value("name").is_some());

    assert!(inspector.detach(&FormId::new("first")).expect("detach"));
    assert!(!inspector.detach(&FormId::new("first")).expect("detach twice"));
    assert!(inspector.controller(&FormId::new("first")).expect("lookup").is_none());
}

#[test]
fn derive_macro_generates_typed_fields() {
    let fields = SignupForm::fields();
    assert_eq!(fields.email().key(), "email");
    assert_eq!(fields.tags().id().kind(), FieldKind::List);

    let form = FormController::new(FormOptions::default());
    form.register_model(&base_signup()).expect("register model");
    assert_eq!(form.value(&fields.age()).expect("age"), 30);

    form.set(&fields.newsletter(), true).expect("set newsletter");
    let model = form.model::<SignupForm>().expect("read model");
    assert_eq!(
        model,
        SignupForm {
            newsletter: true,
            ..base_signup()
        }
    );
    assert_eq!(
        FormState::empty().read::<String>("email"),
        Err(FormError::UnknownField("email".to_string()))
    );
}

#[cfg(feature = "serde")]
#[test]
fn field_values_serialize_with_kind_tags() {
    let value = FieldValue::List(vec![FieldValue::from("a"), FieldValue::Bool(true)]);
    let json = serde_json::to_string(&value).expect("serialize");
    let back: FieldValue = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, value);
    assert!(json.contains("Text"));
}
