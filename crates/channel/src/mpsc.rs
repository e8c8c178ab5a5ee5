// SPDX-License-Identifier: BSD-3-Clause

//! Bounded multi-producer single-consumer channel for `!Send` tasks.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::{RecvError, SendError};

struct State<T> {
    buffer: VecDeque<T>,
    capacity: usize,
    closed: bool,
    senders: usize,
    recv_waker: Option<Waker>,
    send_wakers: VecDeque<Waker>,
}

/// Creates a bounded channel with room for `capacity` buffered values.
#[must_use]
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let state = Rc::new(RefCell::new(State {
        buffer: VecDeque::with_capacity(capacity),
        capacity,
        closed: false,
        senders: 1,
        recv_waker: None,
        send_wakers: VecDeque::new(),
    }));
    (Sender { state: state.clone() }, Receiver { state })
}

/// The sending half; clone freely within the owning task tree.
pub struct Sender<T> {
    state: Rc<RefCell<State<T>>>,
}

/// The receiving half; exactly one exists per channel.
pub struct Receiver<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.state.borrow_mut().senders += 1;
        Sender { state: self.state.clone() }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut st = self.state.borrow_mut();
        st.senders -= 1;
        if st.senders == 0 {
            st.closed = true;
            if let Some(w) = st.recv_waker.take() {
                w.wake();
            }
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut st = self.state.borrow_mut();
        st.closed = true;
        for w in st.send_wakers.drain(..) {
            w.wake();
        }
    }
}

impl<T> Sender<T> {
    /// Attempts to enqueue without waiting.
    pub fn try_send(&self, value: T) -> Result<(), SendError<T>> {
        let mut st = self.state.borrow_mut();
        if st.closed {
            return Err(SendError::Closed(value));
        }
        if st.buffer.len() >= st.capacity {
            return Err(SendError::Full(value));
        }
        st.buffer.push_back(value);
        if let Some(w) = st.recv_waker.take() {
            w.wake();
        }
        Ok(())
    }

    /// Enqueues, waiting for room if the buffer is full.
    pub async fn send(&self, value: T) -> Result<(), SendError<T>> {
        SendFuture { sender: self, value: Some(value) }.await
    }
}

impl<T> Receiver<T> {
    /// Attempts to dequeue without waiting.
    pub fn try_recv(&mut self) -> Result<T, RecvError> {
        let mut st = self.state.borrow_mut();
        if let Some(value) = st.buffer.pop_front() {
            if let Some(w) = st.send_wakers.pop_front() {
                w.wake();
            }
            return Ok(value);
        }
        if st.closed { Err(RecvError::Closed) } else { Err(RecvError::Empty) }
    }

    /// Dequeues, waiting until a value arrives or all senders drop.
    pub async fn recv(&mut self) -> Result<T, RecvError> {
        RecvFuture { receiver: self }.await
    }

    /// Number of values currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.borrow().buffer.len()
    }

    /// True when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct SendFuture<'a, T> {
    sender: &'a Sender<T>,
    value: Option<T>,
}

impl<T> Unpin for SendFuture<'_, T> {}

impl<T> Future for SendFuture<'_, T> {
    type Output = Result<(), SendError<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let value = self.value.take().expect("SendFuture polled after completion");
        match self.sender.try_send(value) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(SendError::Full(value)) => {
                self.value = Some(value);
                let mut st = self.sender.state.borrow_mut();
                st.send_wakers.push_back(cx.waker().clone());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

struct RecvFuture<'a, T> {
    receiver: &'a mut Receiver<T>,
}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Result<T, RecvError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.receiver.try_recv() {
            Ok(value) => Poll::Ready(Ok(value)),
            Err(RecvError::Empty) => {
                let mut st = self.receiver.state.borrow_mut();
                st.recv_waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(missing_docs, clippy::unwrap_used)]
    use super::*;

    fn run_local<F: Future<Output = ()> + 'static>(f: F) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let local = tokio::task::LocalSet::new();
        let handle = local.spawn_local(f);
        rt.block_on(local);
        rt.block_on(handle).expect("test task failed");
    }

    #[test]
    fn fifo_order_across_senders() {
        run_local(async {
            let (tx1, mut rx) = channel(4);
            let tx2 = tx1.clone();
            tx1.try_send(1).unwrap();
            tx2.try_send(2).unwrap();
            assert_eq!(rx.try_recv().unwrap(), 1);
            assert_eq!(rx.try_recv().unwrap(), 2);
            assert_eq!(rx.try_recv().unwrap_err(), RecvError::Empty);
        });
    }

    #[test]
    fn full_buffer_rejects_try_send() {
        run_local(async {
            let (tx, _rx) = channel(1);
            tx.try_send(1).unwrap();
            assert!(matches!(tx.try_send(2), Err(SendError::Full(2))));
        });
    }

    #[test]
    fn blocked_sender_resumes_after_recv() {
        run_local(async {
            let (tx, mut rx) = channel(1);
            tx.try_send(1).unwrap();
            let tx2 = tx.clone();
            let pending = tokio::task::spawn_local(async move { tx2.send(2).await });
            tokio::task::yield_now().await;
            assert_eq!(rx.recv().await.unwrap(), 1);
            pending.await.unwrap().unwrap();
            assert_eq!(rx.recv().await.unwrap(), 2);
        });
    }

    #[test]
    fn dropped_senders_close_the_channel() {
        run_local(async {
            let (tx, mut rx) = channel::<u8>(1);
            tx.try_send(9).unwrap();
            drop(tx);
            assert_eq!(rx.recv().await.unwrap(), 9);
            assert_eq!(rx.recv().await.unwrap_err(), RecvError::Closed);
        });
    }
}
