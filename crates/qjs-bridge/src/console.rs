//! Console API
//!
//! Installs `console.log`, `console.warn`, `console.error`, etc. and routes
//! their output to the context's [`Console`] sink.

use crate::bridge::Bridge;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Value};
use std::fmt::{self, Write};
use std::rc::{Rc, Weak};

/// Console method a message was written with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl ConsoleLevel {
    const ALL: [ConsoleLevel; 5] = [
        ConsoleLevel::Log,
        ConsoleLevel::Info,
        ConsoleLevel::Warn,
        ConsoleLevel::Error,
        ConsoleLevel::Debug,
    ];

    /// Name of the `console` method
    pub fn method(self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Debug => "debug",
        }
    }
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// Destination of script console output
pub trait Console {
    fn write(&self, level: ConsoleLevel, message: &str);
}

/// Default sink: forwards to `tracing` with a `[JS]` prefix
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingConsole;

impl Console for TracingConsole {
    fn write(&self, level: ConsoleLevel, message: &str) {
        match level {
            ConsoleLevel::Error => tracing::error!("[JS] {}", message),
            ConsoleLevel::Warn => tracing::warn!("[JS] {}", message),
            ConsoleLevel::Debug => tracing::debug!("[JS] {}", message),
            ConsoleLevel::Log | ConsoleLevel::Info => tracing::info!("[JS] {}", message),
        }
    }
}

/// Install the console API into the global object
pub(crate) fn install_console(ctx: &Ctx<'_>, bridge: &Rc<Bridge>) -> Result<(), rquickjs::Error> {
    let console = Object::new(ctx.clone())?;

    for level in ConsoleLevel::ALL {
        let bridge = Rc::downgrade(bridge);
        let method = Function::new(ctx.clone(), move |args: Rest<Value>| {
            log_with_level(&bridge, level, args.0);
        })?
        .with_name(level.method())?;
        console.set(level.method(), method)?;
    }

    ctx.globals().set("console", console)?;
    Ok(())
}

fn log_with_level(bridge: &Weak<Bridge>, level: ConsoleLevel, values: Vec<Value>) {
    let mut output = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            output.push(' ');
        }
        format_value(&mut output, value);
    }

    let sink = bridge
        .upgrade()
        .and_then(|bridge| bridge.console.borrow().clone());
    match sink {
        Some(sink) => sink.write(level, &output),
        None => TracingConsole.write(level, &output),
    }
}

/// Format a JavaScript value for logging
fn format_value(out: &mut String, value: &Value) {
    if value.is_undefined() {
        out.push_str("undefined");
    } else if value.is_null() {
        out.push_str("null");
    } else if let Some(b) = value.as_bool() {
        write!(out, "{}", b).ok();
    } else if let Some(n) = value.as_int() {
        write!(out, "{}", n).ok();
    } else if let Some(n) = value.as_float() {
        write!(out, "{}", n).ok();
    } else if let Some(s) = value.as_string() {
        if let Ok(s) = s.to_string() {
            out.push_str(&s);
        }
    } else if let Some(exception) = value.as_exception() {
        out.push_str(&exception.message().unwrap_or_default());
    } else if value.is_array() {
        out.push_str("[Array]");
    } else if value.is_function() {
        out.push_str("[Function]");
    } else if value.is_object() {
        out.push_str("[Object]");
    } else {
        out.push_str("[unknown]");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder(RefCell<Vec<(ConsoleLevel, String)>>);

    impl Console for Recorder {
        fn write(&self, level: ConsoleLevel, message: &str) {
            self.0.borrow_mut().push((level, message.to_string()));
        }
    }

    fn run(source: &str, sink: Option<Rc<Recorder>>) {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let bridge = Bridge::new();
        if let Some(sink) = sink {
            *bridge.console.borrow_mut() = Some(sink);
        }
        context.with(|ctx| {
            install_console(&ctx, &bridge).unwrap();
            let _: Value = ctx.eval(source).unwrap();
        });
        bridge.shutdown();
    }

    #[test]
    fn test_console_log_default_sink() {
        run("console.log('test message')", None);
    }

    #[test]
    fn test_console_multiple_args() {
        let sink = Rc::new(Recorder::default());
        run("console.log('Hello', 42, true, null, [1], {})", Some(sink.clone()));
        let lines = sink.0.borrow();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], (ConsoleLevel::Log, "Hello 42 true null [Array] [Object]".to_string()));
    }

    #[test]
    fn test_console_levels() {
        let sink = Rc::new(Recorder::default());
        run(
            "console.info('info'); console.warn('warn'); console.error('error'); console.debug('debug')",
            Some(sink.clone()),
        );
        let levels: Vec<_> = sink.0.borrow().iter().map(|(level, _)| *level).collect();
        assert_eq!(
            levels,
            vec![ConsoleLevel::Info, ConsoleLevel::Warn, ConsoleLevel::Error, ConsoleLevel::Debug]
        );
    }
}
