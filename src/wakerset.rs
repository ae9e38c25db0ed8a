use std::{collections::HashMap, mem, task::Waker};

/// Identifies one future's waker registration in a [`WakerSet`]. Minted on
/// first registration and kept by the future so later polls replace the
/// stored waker instead of accumulating stale ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WakerToken(u64);

/// Bookkeeping for a group of futures that all wait on one shared piece of
/// work.
///
/// Used in two modes. A batch window needs the full driving-future
/// protocol: the shared batch job is only ever driven by the future that
/// polled most recently, so when that future is dropped another waker must
/// be promoted and woken to take over, forming an unbroken chain of
/// drivers. A single-flight slot only needs the broadcast half: waiters
/// register, the resolver calls [`wake_all`], and a dropped waiter just
/// discards its registration.
///
/// [`wake_all`]: WakerSet::wake_all
#[derive(Debug, Default)]
pub(crate) struct WakerSet {
    wakers: HashMap<WakerToken, Waker>,
    driver: Option<WakerToken>,
    next_token: u64,
}

impl WakerSet {
    /// Upserts the waker for `token`, minting a fresh token on the first
    /// registration. The registering future becomes the driving future,
    /// on the assumption that it is about to poll the shared work.
    pub(crate) fn register(&mut self, token: &mut Option<WakerToken>, waker: &Waker) {
        let token = *token.get_or_insert_with(|| {
            let token = WakerToken(self.next_token);
            self.next_token += 1;
            token
        });

        match self.wakers.get_mut(&token) {
            Some(existing) => existing.clone_from(waker),
            None => {
                self.wakers.insert(token, waker.clone());
            }
        }

        self.driver = Some(token);
    }

    /// Removes a completed future's registration without waking anyone.
    pub(crate) fn discard(&mut self, token: WakerToken) {
        self.wakers.remove(&token);
        if self.driver == Some(token) {
            self.driver = None;
        }
    }

    /// Removes a dropped future's registration. If it was the driving
    /// future (or no driver exists), an arbitrary remaining waker is
    /// promoted to driver and woken, so the shared work always has a path
    /// forward while anyone is still interested in it.
    pub(crate) fn discard_and_wake(&mut self, token: WakerToken) {
        self.wakers.remove(&token);
        if self.driver == Some(token) || self.driver.is_none() {
            match self.wakers.iter().next() {
                Some((&next, waker)) => {
                    self.driver = Some(next);
                    waker.wake_by_ref();
                }
                None => self.driver = None,
            }
        }
    }

    /// Wakes every registered waker. Used when the shared work resolves.
    pub(crate) fn wake_all(self) {
        self.wake_all_except(None);
    }

    /// Wakes every registered waker except the calling future's own; the
    /// caller is about to take its result and does not need the nudge.
    pub(crate) fn wake_all_except(self, token: Option<WakerToken>) {
        for (registered, waker) in self.wakers {
            if Some(registered) != token {
                waker.wake();
            }
        }
    }

    /// Takes the set out of `&mut self`, leaving an empty one behind.
    pub(crate) fn take(&mut self) -> Self {
        mem::take(self)
    }
}
