use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Shared state every hardware module carries: its place in the module tree,
/// a cooperative busy flag, and named counters.
pub struct ModuleCore {
    name: String,
    full_name: String,
    busy: AtomicBool,
    children: Mutex<Vec<Arc<dyn HwModule>>>,
    stats: Mutex<Vec<(String, u64)>>,
}

impl ModuleCore {
    /// Create module state, deriving the dot-joined path from the parent.
    pub fn new(name: impl Into<String>, parent: Option<&ModuleCore>) -> Self {
        let name = name.into();
        let full_name = match parent {
            Some(parent) => format!("{}.{}", parent.full_name, name),
            None => name.clone(),
        };
        Self {
            name,
            full_name,
            busy: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
            stats: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Register `child` for recursive reporting. Children report in adoption
    /// order.
    pub fn adopt(&self, child: Arc<dyn HwModule>) {
        self.children.lock().unwrap().push(child);
    }

    pub fn children(&self) -> Vec<Arc<dyn HwModule>> {
        self.children.lock().unwrap().clone()
    }

    /// The busy flag is cooperative: operations must check it before starting
    /// work and clear it when finished; nothing is enforced here.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    /// Mark the module busy. Returns false when it already was, in which case
    /// the caller must reject the operation.
    pub fn try_set_busy(&self) -> bool {
        !self.busy.swap(true, Ordering::Relaxed)
    }

    pub fn set_idle(&self) {
        self.busy.store(false, Ordering::Relaxed);
    }

    pub fn register_stat(&self, name: &str, initial: u64) {
        let mut stats = self.stats.lock().unwrap();
        match stats.iter_mut().find(|(key, _)| key == name) {
            Some((_, value)) => *value = initial,
            None => stats.push((name.to_string(), initial)),
        }
    }

    /// Counters accumulate monotonically and auto-register on first use.
    pub fn increment_stat(&self, name: &str, by: u64) {
        let mut stats = self.stats.lock().unwrap();
        match stats.iter_mut().find(|(key, _)| key == name) {
            Some((_, value)) => *value += by,
            None => stats.push((name.to_string(), by)),
        }
    }

    pub fn stat(&self, name: &str) -> Option<u64> {
        let stats = self.stats.lock().unwrap();
        stats.iter().find(|(key, _)| key == name).map(|(_, v)| *v)
    }
}

/// A node in the hardware module hierarchy.
pub trait HwModule: Send + Sync {
    fn core(&self) -> &ModuleCore;

    /// Print this module's counters, then recurse into the children in
    /// registration order.
    fn report_stats(&self) {
        let core = self.core();
        println!("--- statistics: [{}] ---", core.full_name());
        {
            let stats = core.stats.lock().unwrap();
            if stats.is_empty() {
                println!("    (no counters)");
            } else {
                let width = stats.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
                for (key, value) in stats.iter() {
                    println!("    {key:<width$} : {value}");
                }
            }
        }
        for child in core.children() {
            child.report_stats();
        }
    }
}
