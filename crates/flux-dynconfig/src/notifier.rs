use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Liveness = Box<dyn Fn() -> bool + Send + Sync>;

struct Listener<E> {
    id: u64,
    handler: Handler<E>,
    /// 收到过实时事件后不再投递回放
    delivered: Arc<AtomicBool>,
    /// 返回 `false` 时订阅在下一次访问时被移除
    alive: Option<Liveness>,
}

impl<E> Listener<E> {
    fn is_alive(&self) -> bool {
        self.alive.as_ref().map_or(true, |alive| alive())
    }
}

struct NotifierState<E> {
    listeners: Vec<Listener<E>>,
    /// 最近一次发出的事件（仅回放模式）
    last: Option<E>,
    closed: bool,
}

impl<E> NotifierState<E> {
    fn prune(&mut self) {
        self.listeners.retain(Listener::is_alive);
    }
}

struct NotifierInner<E> {
    replay: bool,
    next_id: AtomicU64,
    state: Mutex<NotifierState<E>>,
}

impl<E> NotifierInner<E> {
    fn lock(&self) -> MutexGuard<'_, NotifierState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 变更通知器
///
/// 回调在 `emit` 的调用上下文中同步执行，执行时不持有内部锁，
/// 因此回调里可以再次订阅或发布。
///
/// 回放在订阅者加入列表之后、锁外执行。另一线程并发 `emit` 时，若实时事件
/// 先开始投递，较旧的回放会被丢弃；两者同时投递时回调可能被并发调用，顺序不作保证。
pub struct ChangeNotifier<E> {
    inner: Arc<NotifierInner<E>>,
}

impl<E> Clone for ChangeNotifier<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> ChangeNotifier<E> {
    /// 全局通知器：新订阅者只能收到订阅之后的事件
    pub fn new() -> Self {
        Self::build(false)
    }

    /// 单属性通知器：新订阅者会立即收到最近一次事件
    pub fn with_replay() -> Self {
        Self::build(true)
    }

    fn build(replay: bool) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                replay,
                next_id: AtomicU64::new(1),
                state: Mutex::new(NotifierState {
                    listeners: Vec::new(),
                    last: None,
                    closed: false,
                }),
            }),
        }
    }

    /// 订阅事件
    pub fn subscribe<F>(&self, handler: F) -> Subscription<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.attach(Arc::new(handler), None)
    }

    /// 以异步通道的形式订阅
    ///
    /// 接收端被丢弃后订阅自动失效。
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watch = tx.clone();
        self.attach(
            Arc::new(move |event: &E| {
                let _ = tx.send(event.clone());
            }),
            Some(Box::new(move || !watch.is_closed())),
        );
        rx
    }

    fn attach(&self, handler: Handler<E>, alive: Option<Liveness>) -> Subscription<E> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let delivered = Arc::new(AtomicBool::new(false));

        let replayed = {
            let mut state = self.inner.lock();
            state.prune();
            if !state.closed {
                state.listeners.push(Listener {
                    id,
                    handler: handler.clone(),
                    delivered: delivered.clone(),
                    alive,
                });
            }
            if self.inner.replay {
                state.last.clone()
            } else {
                None
            }
        };

        if let Some(event) = replayed {
            if !delivered.swap(true, Ordering::AcqRel) {
                handler(&event);
            }
        }

        Subscription {
            id,
            notifier: Arc::downgrade(&self.inner),
        }
    }

    /// 发布事件，返回收到事件的订阅者数量
    pub fn emit(&self, event: E) -> usize {
        let listeners: Vec<(Handler<E>, Arc<AtomicBool>)> = {
            let mut state = self.inner.lock();
            if state.closed {
                return 0;
            }
            if self.inner.replay {
                state.last = Some(event.clone());
            }
            state.prune();
            state
                .listeners
                .iter()
                .map(|l| (l.handler.clone(), l.delivered.clone()))
                .collect()
        };

        for (handler, delivered) in &listeners {
            delivered.store(true, Ordering::Release);
            handler(&event);
        }

        listeners.len()
    }

    /// 关闭通道，之后的事件将被丢弃
    pub fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        state.listeners.clear();
        state.last = None;
    }

    /// 清空订阅者与回放缓存，通道保持可用
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.listeners.clear();
        state.last = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.inner.lock();
        state.prune();
        state.listeners.len()
    }

    /// 最近一次事件（仅回放模式）
    pub fn last(&self) -> Option<E> {
        self.inner.lock().last.clone()
    }
}

impl<E: Clone + Send + 'static> Default for ChangeNotifier<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// 订阅句柄
///
/// 丢弃句柄不会取消订阅，需要显式调用 `unsubscribe`。
pub struct Subscription<E> {
    id: u64,
    notifier: Weak<NotifierInner<E>>,
}

impl<E> Subscription<E> {
    /// 取消订阅，返回订阅是否仍然存在
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.notifier.upgrade() else {
            return false;
        };
        let mut state = inner.lock();
        let before = state.listeners.len();
        state.listeners.retain(|l| l.id != self.id);
        state.listeners.len() != before
    }
}

impl<E> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_global_notifier_has_no_backlog() {
        let notifier = ChangeNotifier::<i32>::new();
        notifier.emit(1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        notifier.subscribe(move |v| sink.lock().unwrap().push(*v));

        notifier.emit(2);
        notifier.emit(3);

        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_replay_delivers_last_event_on_subscribe() {
        let notifier = ChangeNotifier::<i32>::with_replay();
        notifier.emit(1);
        notifier.emit(2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        notifier.subscribe(move |v| sink.lock().unwrap().push(*v));
        notifier.emit(3);

        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_unsubscribe() {
        let notifier = ChangeNotifier::<i32>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let subscription = notifier.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(notifier.emit(1), 1);
        assert!(subscription.unsubscribe());
        assert_eq!(notifier.emit(2), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_notifier_drops_events() {
        let notifier = ChangeNotifier::<i32>::with_replay();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        notifier.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        notifier.emit(1);
        notifier.close();
        assert_eq!(notifier.emit(2), 0);
        assert!(notifier.is_closed());
        assert!(notifier.last().is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_subscribe_from_handler() {
        let notifier = ChangeNotifier::<i32>::new();
        let inner = notifier.clone();
        notifier.subscribe(move |_| {
            inner.subscribe(|_| {});
        });

        notifier.emit(1);
        assert_eq!(notifier.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_channel() {
        let notifier = ChangeNotifier::<i32>::new();
        let mut rx = notifier.subscribe_channel();

        notifier.emit(7);
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_dropped_channel_receiver_is_pruned() {
        let notifier = ChangeNotifier::<i32>::new();
        for _ in 0..5 {
            drop(notifier.subscribe_channel());
        }
        assert_eq!(notifier.subscriber_count(), 0);

        let mut rx = notifier.subscribe_channel();
        assert_eq!(notifier.emit(1), 1);
        assert_eq!(rx.recv().await, Some(1));

        drop(rx);
        assert_eq!(notifier.emit(2), 0);
    }

    #[test]
    fn test_emit_from_replay_handler_keeps_order() {
        let notifier = ChangeNotifier::<i32>::with_replay();
        notifier.emit(1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reentrant = notifier.clone();
        notifier.subscribe(move |v| {
            sink.lock().unwrap().push(*v);
            if *v == 1 {
                reentrant.emit(2);
            }
        });

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(notifier.last(), Some(2));
    }
}
