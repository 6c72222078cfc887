//! End-to-end coverage: compile source, run it under the scheduler
//! against a mock host, observe effects through the membrane.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
	compile::compile,
	scheduler::Scheduler,
	scriptable::{CallCtx, ExternalOutcome, Host, MethodOutcome, ObjectId, Wait},
	value::Value,
};

#[derive(Default)]
struct MockHost {
	globals: FxHashMap<String, Value>,
	printed: Vec<String>,
	objects: FxHashMap<ObjectId, FxHashMap<String, Value>>,
	busy: FxHashSet<ObjectId>,
}

impl MockHost {
	fn add_object(&mut self, raw: u64) -> ObjectId {
		let id = ObjectId::new(raw);
		self.objects.insert(id, FxHashMap::default());
		id
	}

	fn global(&self, name: &str) -> Value {
		self.globals.get(name).cloned().unwrap_or(Value::Null)
	}
}

impl Host for MockHost {
	fn object_alive(&self, id: ObjectId) -> bool {
		self.objects.contains_key(&id)
	}

	fn object_ready(&self, id: ObjectId) -> bool {
		!self.busy.contains(&id)
	}

	fn get_property(&mut self, id: ObjectId, name: &str) -> Option<Value> {
		self.objects.get(&id).and_then(|props| props.get(name).cloned())
	}

	fn set_property(&mut self, id: ObjectId, name: &str, value: Value) -> bool {
		let Some(props) = self.objects.get_mut(&id) else {
			return false;
		};

		props.insert(name.to_string(), value);
		true
	}

	fn call_method(
		&mut self,
		id: ObjectId,
		name: &str,
		_args: &[Value],
		_ctx: &CallCtx,
	) -> MethodOutcome {
		match name {
			"poke" => MethodOutcome::Value(Value::Int(7)),
			"walkto" => {
				self.busy.insert(id);
				MethodOutcome::Suspend(Wait::Object(id))
			}
			_ => MethodOutcome::NotHandled,
		}
	}

	fn call_external(&mut self, name: &str, args: &[Value], _ctx: &CallCtx) -> ExternalOutcome {
		match name {
			"print" => {
				self.printed.push(args.first().map(Value::to_display).unwrap_or_default());
				ExternalOutcome::Value(Value::Null)
			}
			_ => ExternalOutcome::Missing,
		}
	}

	fn create_object(&mut self, class: &str, _args: Vec<Value>) -> Option<Value> {
		(class == "dummy").then(|| {
			let id = ObjectId::new(1000 + self.objects.len() as u64);
			self.objects.insert(id, FxHashMap::default());
			Value::Object(id)
		})
	}

	fn get_global(&mut self, name: &str) -> Value {
		self.globals.get(name).cloned().unwrap_or(Value::Null)
	}

	fn set_global(&mut self, name: &str, value: Value) {
		self.globals.insert(name.to_string(), value);
	}
}

fn run(source: &str, host: &mut MockHost, ticks: u32, dt: u64) -> Scheduler {
	let image = Arc::new(compile(source, "test.script").unwrap());
	let mut sched = Scheduler::default();
	sched.load(image, None);

	for _ in 0..ticks {
		sched.tick(dt, host);
	}

	sched
}

#[test]
fn short_circuit_and() {
	let mut host = MockHost::default();

	run(
		r#"
		global x; global r;
		x = 0;
		r = false && Touch();
		function Touch() { x = x + 1; return true; }
		"#,
		&mut host,
		4,
		10,
	);

	assert!(host.global("x").loose_eq(&Value::Int(0)));
	assert!(host.global("r").loose_eq(&Value::Bool(false)));
}

#[test]
fn short_circuit_or() {
	let mut host = MockHost::default();

	run(
		r#"
		global x; global r;
		x = 0;
		r = true || Touch();
		function Touch() { x = x + 1; return true; }
		"#,
		&mut host,
		4,
		10,
	);

	assert!(host.global("x").loose_eq(&Value::Int(0)));
	assert!(host.global("r").loose_eq(&Value::Bool(true)));
}

#[test]
fn logical_rhs_runs_when_needed() {
	let mut host = MockHost::default();

	run(
		r#"
		global x; global r;
		x = 0;
		r = true && Touch();
		function Touch() { x = x + 1; return 5; }
		"#,
		&mut host,
		4,
		10,
	);

	assert!(host.global("x").loose_eq(&Value::Int(1)));
	assert!(host.global("r").loose_eq(&Value::Int(5)));
}

#[test]
fn cooperative_sleep() {
	let mut host = MockHost::default();
	let image = Arc::new(
		compile(
			r#"Print("A"); Sleep(100); Print("B");"#,
			"sleepy.script",
		)
		.unwrap(),
	);

	let mut sched = Scheduler::default();
	sched.load(image, None);

	sched.tick(0, &mut host);
	assert_eq!(host.printed, vec!["A"]);

	sched.tick(50, &mut host);
	assert_eq!(host.printed, vec!["A"], "woke 50 ms early");

	sched.tick(49, &mut host);
	assert_eq!(host.printed, vec!["A"], "woke 1 ms early");

	sched.tick(1, &mut host);
	assert_eq!(host.printed, vec!["A", "B"]);
	assert_eq!(sched.script_count(), 0, "finished scripts must be reaped");
}

#[test]
fn control_flow_loops() {
	let mut host = MockHost::default();

	run(
		r#"
		global total; global evens;
		total = 0;
		evens = 0;

		for (var i = 1; i <= 10; i += 1) {
			total += i;
			if (i % 2 == 1) continue;
			evens += 1;
		}

		global classified;
		switch (total) {
			case 54: classified = "wrong";  break;
			case 55: classified = "right";  break;
			default: classified = "lost";
		}

		global countdown;
		countdown = 0;
		var n = 3;
		while (n > 0) { countdown += 1; n -= 1; }
		"#,
		&mut host,
		4,
		10,
	);

	assert!(host.global("total").loose_eq(&Value::Int(55)));
	assert!(host.global("evens").loose_eq(&Value::Int(5)));
	assert!(host.global("classified").loose_eq(&Value::from("right")));
	assert!(host.global("countdown").loose_eq(&Value::Int(3)));
}

#[test]
fn functions_and_recursion() {
	let mut host = MockHost::default();

	run(
		r#"
		global fib7; global sum;
		fib7 = Fib(7);
		sum = Add3(1, 2, 3);

		function Fib(n) {
			if (n < 2) return n;
			return Fib(n - 1) + Fib(n - 2);
		}

		function Add3(a, b, c) { return a + b + c; }
		"#,
		&mut host,
		4,
		10,
	);

	assert!(host.global("fib7").loose_eq(&Value::Int(13)));
	assert!(host.global("sum").loose_eq(&Value::Int(6)));
}

#[test]
fn arrays_and_ternary() {
	let mut host = MockHost::default();

	run(
		r#"
		global third; global len; global pick;
		var items = [10, 20, 30];
		items[3] = items[0] + items[1];
		third = items[3];
		len = items.length;
		pick = len > 3 ? "long" : "short";
		"#,
		&mut host,
		4,
		10,
	);

	assert!(host.global("third").loose_eq(&Value::Int(30)));
	assert!(host.global("len").loose_eq(&Value::Int(4)));
	assert!(host.global("pick").loose_eq(&Value::from("long")));
}

#[test]
fn dead_reference_reads_null() {
	let mut host = MockHost::default();
	let door = host.add_object(1);
	host.set_property(door, "name", Value::from("front door"));
	host.set_global("door", Value::Object(door));

	let image = Arc::new(
		compile(
			r#"
			global before; global after; global isnull;
			before = door.Name;
			Sleep(10);
			after = door.Name;
			isnull = door == null;
			"#,
			"door.script",
		)
		.unwrap(),
	);

	let mut sched = Scheduler::default();
	sched.load(image, None);
	sched.tick(0, &mut host);

	assert!(host.global("before").loose_eq(&Value::from("front door")));

	// The host destroys the object while the script sleeps.
	host.objects.remove(&door);
	sched.tick(10, &mut host);

	assert!(host.global("after").is_null());
	assert!(host.global("isnull").loose_eq(&Value::Bool(true)));
}

#[test]
fn native_methods_and_blocking_calls() {
	let mut host = MockHost::default();
	let actor = host.add_object(2);
	host.set_global("actor", Value::Object(actor));

	let image = Arc::new(
		compile(
			r#"
			global poked; global arrived;
			poked = actor.Poke();
			actor.WalkTo(100, 200);
			arrived = 1;
			"#,
			"walk.script",
		)
		.unwrap(),
	);

	let mut sched = Scheduler::default();
	sched.load(image, None);

	sched.tick(10, &mut host);
	assert!(host.global("poked").loose_eq(&Value::Int(7)));
	assert!(host.global("arrived").is_null(), "blocked call must suspend");

	sched.tick(10, &mut host);
	assert!(host.global("arrived").is_null(), "still walking");

	host.busy.remove(&actor);
	sched.tick(10, &mut host);
	assert!(host.global("arrived").loose_eq(&Value::Int(1)));
}

#[test]
fn attached_method_dispatch() {
	let mut host = MockHost::default();
	let door = host.add_object(3);
	host.set_global("door", Value::Object(door));

	let attached = Arc::new(
		compile(
			r#"method Open(amount) { return amount + 1; }"#,
			"door_logic.script",
		)
		.unwrap(),
	);

	let caller = Arc::new(
		compile(
			r#"global result; result = door.Open(41);"#,
			"caller.script",
		)
		.unwrap(),
	);

	let mut sched = Scheduler::default();
	sched.attach(door, attached);
	sched.load(caller, None);

	for _ in 0..4 {
		sched.tick(10, &mut host);
	}

	assert!(host.global("result").loose_eq(&Value::Int(42)));
}

#[test]
fn unknown_method_errors_the_caller_only() {
	let mut host = MockHost::default();
	let door = host.add_object(4);
	host.set_global("door", Value::Object(door));

	let bad = Arc::new(
		compile(
			r#"global before; global after; before = 1; door.NoSuch(); after = 1;"#,
			"bad.script",
		)
		.unwrap(),
	);

	let good = Arc::new(compile(r#"global ok; ok = 1;"#, "good.script").unwrap());

	let mut sched = Scheduler::default();
	sched.load(bad, None);
	sched.load(good, None);

	for _ in 0..3 {
		sched.tick(10, &mut host);
	}

	assert!(host.global("before").loose_eq(&Value::Int(1)));
	assert!(host.global("after").is_null(), "script must stop at the error");
	assert!(host.global("ok").loose_eq(&Value::Int(1)), "other scripts unaffected");
	assert_eq!(sched.script_count(), 0);
}

#[test]
fn external_miss_is_a_runtime_error() {
	let mut host = MockHost::default();

	run(
		r#"global before; global after; before = 1; Bogus(); after = 1;"#,
		&mut host,
		3,
		10,
	);

	assert!(host.global("before").loose_eq(&Value::Int(1)));
	assert!(host.global("after").is_null());
}

#[test]
fn events_dispatch_fifo_once_per_subscriber() {
	let mut host = MockHost::default();
	let button = host.add_object(5);

	let attached = Arc::new(
		compile(
			r#"
			global clicks;
			clicks = 0;
			on "LeftClick" { clicks = clicks + 1; Print("click " + clicks); }
			on "RightClick" { Print("context"); }
			"#,
			"button.script",
		)
		.unwrap(),
	);

	let mut sched = Scheduler::default();
	sched.attach(button, attached);

	// Let the attachment's top-level code run first.
	sched.tick(10, &mut host);

	sched.emit_event(button, "LeftClick", vec![]);
	sched.emit_event(button, "LeftClick", vec![]);
	sched.emit_event(button, "RightClick", vec![]);
	sched.emit_event(button, "NoSubscriber", vec![]);

	// Handlers spawn at the end of this tick, run in the next.
	sched.tick(10, &mut host);
	sched.tick(10, &mut host);

	assert!(host.global("clicks").loose_eq(&Value::Int(2)));
	assert_eq!(host.printed, vec!["click 1", "click 2", "context"]);
}

#[test]
fn kill_stops_a_spinning_script() {
	let mut host = MockHost::default();
	let image = Arc::new(
		compile(
			r#"global spins; spins = 0; while (true) { spins += 1; Yield(); }"#,
			"spin.script",
		)
		.unwrap(),
	);

	let mut sched = Scheduler::default();
	let id = sched.load(image, None);

	sched.tick(10, &mut host);
	sched.tick(10, &mut host);
	assert!(host.global("spins").loose_eq(&Value::Int(2)), "one spin per tick");
	assert!(sched.is_live(id));

	sched.kill(id);
	sched.tick(10, &mut host);
	assert_eq!(sched.script_count(), 0);
	assert!(host.global("spins").loose_eq(&Value::Int(2)));
}

#[test]
fn slice_budget_interleaves_scripts() {
	let mut host = MockHost::default();

	let spinner = Arc::new(
		compile(
			r#"global a; a = 0; while (true) { a += 1; }"#,
			"spinner.script",
		)
		.unwrap(),
	);

	let other = Arc::new(compile(r#"global b; b = 1;"#, "other.script").unwrap());

	let mut sched = Scheduler::default();
	sched.set_budget(64);
	sched.load(spinner, None);
	sched.load(other, None);

	sched.tick(10, &mut host);

	// The spinner exhausted its budget without starving the other script.
	assert!(host.global("b").loose_eq(&Value::Int(1)));
	assert!(host.global("a").as_int() > 0);

	let a_before = host.global("a").as_int();
	sched.tick(10, &mut host);
	assert!(host.global("a").as_int() > a_before);
}

#[test]
fn new_object_expression() {
	let mut host = MockHost::default();

	run(
		r#"
		global made; global strict_same; global strict_other;
		var d = new Dummy();
		var e = d;
		made = d != null;
		strict_same = d === e;
		strict_other = d === new Dummy();
		"#,
		&mut host,
		3,
		10,
	);

	assert!(host.global("made").loose_eq(&Value::Bool(true)));
	assert!(host.global("strict_same").loose_eq(&Value::Bool(true)));
	assert!(host.global("strict_other").loose_eq(&Value::Bool(false)));
}
