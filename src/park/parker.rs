// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;
use std::time::Duration;

use crate::park::Park;

#[derive(Debug)]
pub struct Parker<P>(Arc<P>);

#[derive(Debug, Clone)]
pub struct UnparkToken<P>(Parker<P>);

impl<P> Clone for Parker<P> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<P: Park> Parker<P> {
    pub fn new(park_impl: P) -> Self {
        Self(Arc::new(park_impl))
    }

    #[inline]
    pub fn park(&self) {
        self.0.park();
    }

    #[inline]
    pub fn park_timeout(&self, timeout: Duration) {
        self.0.park_timeout(timeout);
    }

    /// Attempts to unpark itself.
    ///
    /// Not terribly useful on its own, but lets a worker wake itself after
    /// re-registering interest in something it had already given up on.
    #[inline]
    pub fn unpark(&self) {
        self.0.unpark();
    }

    /// Converts this `Parker` into an [`UnparkToken`] another thread can use
    /// to wake it.
    #[inline]
    pub fn into_unpark(self) -> UnparkToken<P> {
        UnparkToken(self)
    }
}

impl<P: Park> UnparkToken<P> {
    #[inline]
    pub fn unpark(&self) {
        self.0.unpark();
    }

    /// Whether this token was minted from `parker`.
    ///
    /// Lets a worker waking from `park`/`park_timeout` recognize and remove
    /// its own still-registered token (a timeout or spurious wake, rather
    /// than having been popped and unparked by a publisher) without relying
    /// on anything beyond pointer identity.
    #[inline]
    #[must_use]
    pub fn is(&self, parker: &Parker<P>) -> bool {
        Arc::ptr_eq(&self.0.0, &parker.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::park::ThreadPark;
    use std::sync::mpsc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn parking_basically_works() {
        static A_UNPARKED: AtomicBool = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel();

        let a = thread::spawn(move || {
            let parker = Parker::new(ThreadPark::for_current());
            tx.send(parker.clone().into_unpark()).unwrap();
            parker.park();
            A_UNPARKED.store(true, Ordering::Release);
        });

        let b = thread::spawn(move || {
            let unpark = rx.recv().unwrap();
            unpark.unpark();
        });

        let _ = a.join();
        let _ = b.join();

        assert!(A_UNPARKED.load(Ordering::Acquire));
    }
}
