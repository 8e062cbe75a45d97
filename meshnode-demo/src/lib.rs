use std::sync::atomic::{AtomicU64, Ordering};

use meshnode::{Context, Result};

#[meshnode::api]
pub trait EchoService {
    async fn echo(&self, ctx: &Context, message: String) -> Result<String>;

    async fn greet(&self, ctx: &Context, name: String, times: Option<u32>) -> Result<String>;
}

#[derive(Default)]
pub struct Echo {
    greeted: AtomicU64,
}

impl EchoService for Echo {
    async fn echo(&self, _: &Context, message: String) -> Result<String> {
        Ok(message)
    }

    async fn greet(&self, ctx: &Context, name: String, times: Option<u32>) -> Result<String> {
        let idx = self.greeted.fetch_add(1, Ordering::AcqRel);
        let greeting = format!("hello {name}({idx}) from {}", ctx.peer.address);
        Ok(vec![greeting; times.unwrap_or(1).max(1) as usize].join(", "))
    }
}
