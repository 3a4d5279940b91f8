use std::sync::{Mutex, PoisonError};

type Filter<T> = Box<dyn Fn(&T) -> bool + Send>;

struct Subscriber<T> {
    filter: Filter<T>,
    sender: async_channel::Sender<T>,
}

/// A hot, multi consumer stream.
///
/// Each subscriber registers a filter and gets its own channel.  Items are
/// only delivered to subscribers attached at the time they're published, in
/// publish order.  Closed subscriber channels are pruned on the next publish.
pub(crate) struct Broadcaster<T> {
    capacity: Option<usize>,
    subscribers: Mutex<Option<Vec<Subscriber<T>>>>,
}

impl<T> Broadcaster<T>
where
    T: Clone,
{
    /// A broadcaster whose subscribers each buffer up to `capacity` items.
    ///
    /// Publishing waits for space, so a slow subscriber slows the publisher.
    pub(crate) fn bounded(capacity: usize) -> Self {
        Broadcaster {
            capacity: Some(capacity.max(1)),
            subscribers: Mutex::new(Some(Vec::new())),
        }
    }

    /// A broadcaster whose subscribers never apply backpressure.
    pub(crate) fn unbounded() -> Self {
        Broadcaster {
            capacity: None,
            subscribers: Mutex::new(Some(Vec::new())),
        }
    }

    pub(crate) fn subscribe(
        &self,
        filter: impl Fn(&T) -> bool + Send + 'static,
    ) -> async_channel::Receiver<T> {
        let (sender, receiver) = match self.capacity {
            Some(capacity) => async_channel::bounded(capacity),
            None => async_channel::unbounded(),
        };

        match self.lock().as_mut() {
            Some(subscribers) => subscribers.push(Subscriber {
                filter: Box::new(filter),
                sender,
            }),
            None => {
                sender.close();
            }
        }

        receiver
    }

    pub(crate) fn subscribe_all(&self) -> async_channel::Receiver<T> {
        self.subscribe(|_| true)
    }

    /// Delivers `item` to every matching subscriber, waiting for buffer space
    /// where needed.  Returns the number of subscribers that received it.
    pub(crate) async fn publish(&self, item: T) -> usize {
        let mut delivered = 0;
        for sender in self.matching(&item) {
            if sender.send(item.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Delivers `item` without waiting.  Subscribers with full buffers miss it.
    pub(crate) fn try_publish(&self, item: T) -> usize {
        self.matching(&item)
            .into_iter()
            .filter(|sender| sender.try_send(item.clone()).is_ok())
            .count()
    }

    /// Ends every subscriber's stream.  Later subscribers get a closed stream.
    pub(crate) fn close(&self) {
        if let Some(subscribers) = self.lock().take() {
            for subscriber in subscribers {
                subscriber.sender.close();
            }
        }
    }

    fn matching(&self, item: &T) -> Vec<async_channel::Sender<T>> {
        let mut guard = self.lock();
        let Some(subscribers) = guard.as_mut() else {
            return Vec::new();
        };

        subscribers.retain(|subscriber| !subscriber.sender.is_closed());
        subscribers
            .iter()
            .filter(|subscriber| (subscriber.filter)(item))
            .map(|subscriber| subscriber.sender.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Vec<Subscriber<T>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
