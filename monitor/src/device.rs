use crate::errors::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Instantaneous state of one outlet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutletReading {
    pub enabled: bool,
    pub wattage: f64,
}

/// Handle to a single smart-plug outlet on the local network.
#[async_trait]
pub trait Outlet: Send + Sync {
    /// User-visible name; unique within one discovery result.
    fn alias(&self) -> &str;

    async fn read(&self) -> Result<OutletReading>;

    async fn set_enabled(&self, enabled: bool) -> Result<()>;
}

/// Finds the outlets currently reachable. Results are best effort and may be
/// partial.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<Arc<dyn Outlet>>>;
}

#[async_trait]
impl<T: Discovery + ?Sized> Discovery for Arc<T> {
    async fn discover(&self) -> Result<Vec<Arc<dyn Outlet>>> {
        (**self).discover().await
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use crate::errors::Error;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy)]
    struct FakeState {
        enabled: bool,
        wattage: f64,
        reachable: bool,
        hang: bool,
        reject_writes: bool,
    }

    /// Scriptable outlet: tests flip reachability, stall reads, or reject
    /// writes, and inspect what was written.
    pub struct FakeOutlet {
        alias: String,
        state: Mutex<FakeState>,
        writes: Mutex<Vec<bool>>,
    }

    impl FakeOutlet {
        pub fn new(alias: &str, wattage: f64) -> Arc<Self> {
            Arc::new(Self {
                alias: alias.to_string(),
                state: Mutex::new(FakeState {
                    enabled: true,
                    wattage,
                    reachable: true,
                    hang: false,
                    reject_writes: false,
                }),
                writes: Mutex::new(Vec::new()),
            })
        }

        pub fn set_wattage(&self, wattage: f64) {
            self.state.lock().unwrap().wattage = wattage;
        }

        pub fn set_reachable(&self, reachable: bool) {
            self.state.lock().unwrap().reachable = reachable;
        }

        pub fn set_hang(&self, hang: bool) {
            self.state.lock().unwrap().hang = hang;
        }

        pub fn reject_writes(&self) {
            self.state.lock().unwrap().reject_writes = true;
        }

        pub fn writes(&self) -> Vec<bool> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Outlet for FakeOutlet {
        fn alias(&self) -> &str {
            &self.alias
        }

        async fn read(&self) -> Result<OutletReading> {
            let state = *self.state.lock().unwrap();
            if state.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if !state.reachable {
                return Err(Error::unreachable(&self.alias, "connection refused"));
            }
            Ok(OutletReading {
                enabled: state.enabled,
                wattage: if state.enabled { state.wattage } else { 0.0 },
            })
        }

        async fn set_enabled(&self, enabled: bool) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.reject_writes {
                return Err(Error::unreachable(&self.alias, "write rejected"));
            }
            state.enabled = enabled;
            self.writes.lock().unwrap().push(enabled);
            Ok(())
        }
    }

    enum Scripted {
        Found(Vec<Arc<dyn Outlet>>),
        Fail,
    }

    /// Discovery that answers with whatever the test scripted last.
    pub struct FakeDiscovery {
        next: Mutex<Scripted>,
        calls: Mutex<usize>,
    }

    impl FakeDiscovery {
        pub fn new(outlets: Vec<Arc<dyn Outlet>>) -> Self {
            Self {
                next: Mutex::new(Scripted::Found(outlets)),
                calls: Mutex::new(0),
            }
        }

        pub fn answer(&self, outlets: Vec<Arc<dyn Outlet>>) {
            *self.next.lock().unwrap() = Scripted::Found(outlets);
        }

        pub fn fail(&self) {
            *self.next.lock().unwrap() = Scripted::Fail;
        }

        pub fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Discovery for FakeDiscovery {
        async fn discover(&self) -> Result<Vec<Arc<dyn Outlet>>> {
            *self.calls.lock().unwrap() += 1;
            match &*self.next.lock().unwrap() {
                Scripted::Found(outlets) => Ok(outlets.clone()),
                Scripted::Fail => Err(Error::Discovery("scripted failure".to_string())),
            }
        }
    }
}
