//! A simple example of what ripple has to offer

use ripple::event::emitter::Emitter;
use ripple::event::multiplexer::EventMultiplexer;
use ripple::event::ops::*;

use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum EventType {
  EventA(i32),
  EventB(i32),
}

impl EventType {
  fn unwrap(&self) -> i32 {
    match self {
      Self::EventA(value) => *value,
      Self::EventB(value) => *value,
    }
  }
}

impl std::fmt::Display for EventType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::EventA(value) => write!(f, "Event A with value '{}'", value)?,
      Self::EventB(value) => write!(f, "Event B with value '{}'", value)?,
    };
    Ok(())
  }
}

fn main() {
  let a = Emitter::<EventType>::new();
  let b = Emitter::<EventType>::new();
  let merge = EventMultiplexer::new();
  let _a = merge
    .add(a.event().map(|x: EventType| EventType::EventA(x.unwrap().pow(2))));
  let _b = merge
    .add(b.event().map(|x: EventType| EventType::EventB(x.unwrap() * 3)));
  let _printer = merge.event().subscribe(|x| println!("{}", x));
  let (tx, rx) = mpsc::channel();
  let tx = Mutex::new(tx);
  let _total = merge
    .event()
    .filter(|x: &EventType| x.unwrap() > 1)
    .debounce(
      |sum: Option<i32>, x: EventType| sum.unwrap_or(0) + x.unwrap(),
      DebounceOptions::new(Duration::from_millis(50)),
    )
    .subscribe(move |total| {
      let _ = tx.lock().map(|tx| tx.send(total));
    });
  // Unlike the printer, the total only arrives once the burst has been quiet
  // for the debounce delay.
  a.fire(EventType::EventA(1));
  a.fire(EventType::EventA(2));
  a.fire(EventType::EventA(3));
  b.fire(EventType::EventB(1));
  b.fire(EventType::EventB(2));
  b.fire(EventType::EventB(3));
  println!("total of values above 1: {}", rx.recv().unwrap());
}
