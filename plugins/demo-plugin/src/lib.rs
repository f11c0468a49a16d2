//! Demo Lumen plugin.
//!
//! This plugin provides:
//! - `demo::comp`: a component holding one integer, configured from `{"value": n}`
//! - `demo::counter`: a component counting how often it was accumulated into

use lumen::component::{Component, ConstructContext, Props};
use lumen::error::{Error, Result};
use lumen::serial::{InputArchive, OutputArchive};

/// A component holding a single integer.
#[derive(Default)]
pub struct DemoComp {
    value: i64,
}

impl DemoComp {
    /// Current value.
    pub fn value(&self) -> i64 {
        self.value
    }
}

impl Component for DemoComp {
    fn construct(&mut self, ctx: &ConstructContext<'_>) -> Result<()> {
        if let Some(value) = ctx.props.get("value") {
            self.value = value
                .as_i64()
                .ok_or_else(|| Error::Config("'value' must be an integer".into()))?;
        }
        Ok(())
    }

    fn save(&self, ar: &mut OutputArchive) -> Result<()> {
        ar.write_i64(self.value);
        Ok(())
    }

    fn load(&mut self, ar: &mut InputArchive<'_>) -> Result<()> {
        self.value = ar.read_i64()?;
        Ok(())
    }

    fn underlying_value(&self, query: &str) -> Props {
        match query {
            "value" => Props::from(self.value),
            _ => Props::Null,
        }
    }
}

/// Counts accumulations of other counters.
#[derive(Default)]
pub struct Counter {
    count: u64,
}

impl Component for Counter {
    fn save(&self, ar: &mut OutputArchive) -> Result<()> {
        ar.write_u64(self.count);
        Ok(())
    }

    fn load(&mut self, ar: &mut InputArchive<'_>) -> Result<()> {
        self.count = ar.read_u64()?;
        Ok(())
    }

    fn underlying_value(&self, query: &str) -> Props {
        match query {
            "count" => Props::from(self.count),
            _ => Props::Null,
        }
    }

    fn accumulate(&mut self, partial: &dyn Component) -> Result<()> {
        let other = partial
            .as_any()
            .downcast_ref::<Counter>()
            .ok_or_else(|| Error::Unsupported("counter accumulates counters only".into()))?;
        self.count += other.count + 1;
        Ok(())
    }
}

lumen::define_plugin! {
    name: "demo",
    version: "0.1.0",
    description: "Demo components for plugin loading",
    components: [
        {
            ident: demo_comp,
            key: "demo::comp",
            description: "Holds one integer",
            create: || Box::new(DemoComp::default()),
        },
        {
            ident: counter,
            key: "demo::counter",
            description: "Counts accumulations",
            create: || Box::new(Counter::default()),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor() {
        let descriptor = unsafe { &*lumen_plugin_descriptor() };
        assert_eq!(descriptor.abi_version, lumen::plugin::LUMEN_ABI_VERSION);
        assert_eq!(descriptor.num_components, 2);
    }

    #[test]
    fn test_counter_accumulate() {
        let mut a = Counter::default();
        let b = Counter { count: 2 };
        a.accumulate(&b).unwrap();
        assert_eq!(a.underlying_value("count"), Props::from(3u64));
        assert!(a.accumulate(&DemoComp::default()).is_err());
    }
}
