//! Push-style futures and promises on top of the reactor.
//!
//! A [`Promise`] and its [`Future`] jointly own a shared state bound to one
//! reactor.  The producer stores a value or an error in the promise; the
//! consumer registers a result handler and an error handler on the future.
//! As soon as the shared state holds both a result (or error) and the
//! handlers, an immediate event is queued on the reactor, which dispatches
//! the matching handler exactly once at the next tick.
//!
//! Unlike `std::future`, which is pulled from, completion here is pushed
//! into continuations; and everything is single-threaded: there are no
//! locks, and all state mutation happens inside the reactor's dispatch.
//!
//! [`chain`] composes step-wise asynchronous flows, with a terminal
//! [`ChainedFuture::catch`] acting as the single error sink for the whole
//! chain; [`when_all`] joins a set of futures of the same type into one.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::reactor::Reactor;

type ResultHandler<T> = Box<dyn FnOnce(T) -> Result<()>>;
type ErrorHandler = Box<dyn FnOnce(Error) -> Result<()>>;

struct Shared<T> {
    reactor: Reactor,
    future_retrieved: bool,
    result_retrieved: bool,
    /// Set permanently once a value or error has been stored, even after
    /// the value itself has been moved out for dispatch.
    satisfied: bool,
    dispatch_queued: bool,
    value: Option<T>,
    error: Option<Error>,
    result_handler: Option<ResultHandler<T>>,
    error_handler: Option<ErrorHandler>,
}

/// If the shared state holds both a result (or error) and handlers, queue
/// an immediate event that performs the dispatch.  Idempotent.
fn maybe_queue_dispatch<T: 'static>(state: &Rc<RefCell<Shared<T>>>) {
    let reactor = {
        let s = state.borrow();
        if s.dispatch_queued || s.result_retrieved || s.result_handler.is_none() {
            return;
        }
        if s.value.is_none() && s.error.is_none() {
            return;
        }
        s.reactor.clone()
    };
    state.borrow_mut().dispatch_queued = true;
    let state = Rc::clone(state);
    reactor.add_immediate_event(move |_| {
        let (value, error, on_result, on_error) = {
            let mut s = state.borrow_mut();
            s.result_retrieved = true;
            (
                s.value.take(),
                s.error.take(),
                s.result_handler.take(),
                s.error_handler.take(),
            )
        };
        if let (Some(v), Some(handler)) = (value, on_result) {
            handler(v)
        } else if let (Some(e), Some(handler)) = (error, on_error) {
            handler(e)
        } else {
            Ok(())
        }
    });
}

/// The producing half of a one-shot value-or-error communication.
///
/// Dropping a promise that was never satisfied stores a
/// [`Error::BrokenPromise`] in the shared state, which reaches the future's
/// error handler like any other error.
pub struct Promise<T: 'static> {
    state: Rc<RefCell<Shared<T>>>,
}

impl<T: 'static> Promise<T> {
    /// Creates a new promise bound to `reactor`.
    pub fn new(reactor: &Reactor) -> Self {
        Self {
            state: Rc::new(RefCell::new(Shared {
                reactor: reactor.clone(),
                future_retrieved: false,
                result_retrieved: false,
                satisfied: false,
                dispatch_queued: false,
                value: None,
                error: None,
                result_handler: None,
                error_handler: None,
            })),
        }
    }

    /// Creates a promise together with its future.
    pub fn pair(reactor: &Reactor) -> (Self, Future<T>) {
        let mut promise = Self::new(reactor);
        promise.state.borrow_mut().future_retrieved = true;
        let future = Future {
            state: Rc::clone(&promise.state),
        };
        (promise, future)
    }

    /// Returns the single [`Future`] sharing state with this promise.
    ///
    /// Fails with [`Error::FutureAlreadyRetrieved`] on the second call.
    pub fn get_future(&mut self) -> Result<Future<T>> {
        let mut s = self.state.borrow_mut();
        if s.future_retrieved {
            return Err(Error::FutureAlreadyRetrieved);
        }
        s.future_retrieved = true;
        Ok(Future {
            state: Rc::clone(&self.state),
        })
    }

    /// Stores the result value.  Callable once; a second call (or a call
    /// after `set_exception`) fails with [`Error::PromiseAlreadySatisfied`].
    pub fn set_value(&mut self, value: T) -> Result<()> {
        {
            let mut s = self.state.borrow_mut();
            if s.satisfied {
                return Err(Error::PromiseAlreadySatisfied);
            }
            s.satisfied = true;
            s.value = Some(value);
        }
        maybe_queue_dispatch(&self.state);
        Ok(())
    }

    /// Stores an error instead of a value.  Same once-only contract as
    /// [`Promise::set_value`].
    pub fn set_exception(&mut self, error: Error) -> Result<()> {
        {
            let mut s = self.state.borrow_mut();
            if s.satisfied {
                return Err(Error::PromiseAlreadySatisfied);
            }
            s.satisfied = true;
            s.error = Some(error);
        }
        maybe_queue_dispatch(&self.state);
        Ok(())
    }
}

impl<T: 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        let broken = {
            let mut s = self.state.borrow_mut();
            if s.satisfied {
                false
            } else {
                s.satisfied = true;
                s.error = Some(Error::BrokenPromise);
                true
            }
        };
        if broken {
            maybe_queue_dispatch(&self.state);
        }
    }
}

/// The consuming half: the eventual completion (or failure) of an
/// asynchronous operation.
///
/// Obtained from [`Promise::get_future`] or [`Promise::pair`].  Registering
/// handlers consumes the future, so at most one set of handlers can ever be
/// attached.
pub struct Future<T: 'static> {
    state: Rc<RefCell<Shared<T>>>,
}

impl<T: 'static> Future<T> {
    /// Registers the callbacks invoked when a result is ready or an error
    /// occurs.  Exactly one of them will run, exactly once, dispatched as
    /// an immediate event on the associated reactor.
    ///
    /// The handlers may run after this `Future` has been dropped; they live
    /// in the shared state until the promise is satisfied.
    pub fn on_completion<R, E>(self, on_result: R, on_error: E)
    where
        R: FnOnce(T) -> Result<()> + 'static,
        E: FnOnce(Error) -> Result<()> + 'static,
    {
        {
            let mut s = self.state.borrow_mut();
            s.result_handler = Some(Box::new(on_result));
            s.error_handler = Some(Box::new(on_error));
        }
        maybe_queue_dispatch(&self.state);
    }

    /// True until handlers have been registered (which consumes the future,
    /// so a live `Future` value is always valid).
    pub fn valid(&self) -> bool {
        self.state.borrow().result_handler.is_none()
    }

    /// The reactor this future dispatches on.
    pub fn reactor(&self) -> Reactor {
        self.state.borrow().reactor.clone()
    }
}

/// Starts a chain: `handler` runs when `future` resolves and returns the
/// next future in the flow.  Errors — from `future`, from `handler`'s
/// return value, or from any later link — travel down the chain to the
/// terminal [`ChainedFuture::catch`] sink.
pub fn chain<T, R, H>(future: Future<T>, handler: H) -> ChainedFuture<R>
where
    T: 'static,
    R: 'static,
    H: FnOnce(T) -> Result<Future<R>> + 'static,
{
    ChainedFuture { future }.then(handler)
}

/// A future in a `chain(..).then(..).catch(..)` composition.
pub struct ChainedFuture<T: 'static> {
    future: Future<T>,
}

impl<T: 'static> ChainedFuture<T> {
    /// Appends a continuation link.  The handler receives the upstream
    /// value and returns the next future; returning `Err` routes the error
    /// down the chain exactly as if an upstream future had failed.
    pub fn then<R, H>(self, handler: H) -> ChainedFuture<R>
    where
        R: 'static,
        H: FnOnce(T) -> Result<Future<R>> + 'static,
    {
        let reactor = self.future.reactor();
        let (promise, next) = Promise::pair(&reactor);
        let promise = Rc::new(RefCell::new(promise));
        let on_error = forward_error(&promise);
        let p = Rc::clone(&promise);
        self.future.on_completion(
            move |value| match handler(value) {
                Ok(next_future) => {
                    let ok = Rc::clone(&p);
                    let err = Rc::clone(&p);
                    next_future.on_completion(
                        move |v| ok.borrow_mut().set_value(v),
                        move |e| err.borrow_mut().set_exception(e),
                    );
                    Ok(())
                }
                Err(e) => p.borrow_mut().set_exception(e),
            },
            on_error,
        );
        ChainedFuture { future: next }
    }

    /// Appends a terminating link: the handler consumes the value and
    /// returns nothing further.  The resulting [`EndChain`] only accepts a
    /// `catch`.
    pub fn done<H>(self, handler: H) -> EndChain
    where
        H: FnOnce(T) -> Result<()> + 'static,
    {
        let reactor = self.future.reactor();
        let (promise, next) = Promise::pair(&reactor);
        let promise = Rc::new(RefCell::new(promise));
        let on_error = forward_error(&promise);
        let p = Rc::clone(&promise);
        self.future.on_completion(
            move |value| match handler(value) {
                Ok(()) => p.borrow_mut().set_value(()),
                Err(e) => p.borrow_mut().set_exception(e),
            },
            on_error,
        );
        EndChain { future: next }
    }

    /// Terminates the chain with an error sink.  Errors from any upstream
    /// link arrive here; successful completion is discarded.  Without a
    /// `catch`, chain errors are silently dropped — that is by design.
    pub fn catch<H>(self, handler: H)
    where
        H: FnOnce(Error) -> Result<()> + 'static,
    {
        self.future.on_completion(|_| Ok(()), handler);
    }
}

/// The tail of a chain whose last handler returned no future.
pub struct EndChain {
    future: Future<()>,
}

impl EndChain {
    /// See [`ChainedFuture::catch`].
    pub fn catch<H>(self, handler: H)
    where
        H: FnOnce(Error) -> Result<()> + 'static,
    {
        self.future.on_completion(|_| Ok(()), handler);
    }
}

fn forward_error<T: 'static>(
    promise: &Rc<RefCell<Promise<T>>>,
) -> impl FnOnce(Error) -> Result<()> + 'static {
    let p = Rc::clone(promise);
    move |e| p.borrow_mut().set_exception(e)
}

/// Joins `futures` into a single future that resolves once every input has
/// resolved, yielding one `Result` per input in input order.
///
/// The returned future itself never fails; per-future errors are carried in
/// the corresponding vector element.
pub fn when_all<T: 'static>(
    reactor: &Reactor,
    futures: Vec<Future<T>>,
) -> Future<Vec<Result<T>>> {
    struct Join<T: 'static> {
        promise: Option<Promise<Vec<Result<T>>>>,
        remaining: usize,
        results: Vec<Option<Result<T>>>,
    }

    fn settle<T: 'static>(join: &Rc<RefCell<Join<T>>>, index: usize, outcome: Result<T>) -> Result<()> {
        let mut j = join.borrow_mut();
        j.results[index] = Some(outcome);
        j.remaining -= 1;
        if j.remaining == 0 {
            let results: Vec<Result<T>> = j.results.drain(..).flatten().collect();
            if let Some(mut promise) = j.promise.take() {
                promise.set_value(results)?;
            }
        }
        Ok(())
    }

    let count = futures.len();
    let (promise, out) = Promise::pair(reactor);
    if count == 0 {
        // Degenerate case; resolves with an empty vector at the next tick.
        let mut promise = promise;
        let _ = promise.set_value(Vec::new());
        return out;
    }
    let join = Rc::new(RefCell::new(Join {
        promise: Some(promise),
        remaining: count,
        results: (0..count).map(|_| None).collect(),
    }));
    for (index, future) in futures.into_iter().enumerate() {
        let ok = Rc::clone(&join);
        let err = Rc::clone(&join);
        future.on_completion(
            move |v| settle(&ok, index, Ok(v)),
            move |e| settle(&err, index, Err(e)),
        );
    }
    out
}
