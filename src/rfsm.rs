//! Remote finite-state-machine (RFSM) transport.
//!
//! A thin request/reply pattern between a master and a slave.  The master
//! sends *events* (typed byte payloads); the slave replies with its new
//! state tag plus a response payload.  Wire format, one zmq message part
//! per frame:
//!
//! - request: `"EVENT" | event-id | event-data`
//! - reply:   `state-tag (u16 LE) | response-id | response-data`
//!
//! The master allows one outstanding request at a time and attaches a timer
//! to each; an expired timer delivers [`Error::Timeout`] to the response
//! handler and rebuilds the REQ socket, which the REQ/REP state machine
//! requires before the next request can be sent.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::reactor::{Reactor, TimerId};
use crate::wire::EVENT_FRAME;

/// State tag used before the slave has reported any state.
pub const INDETERMINATE_STATE: u16 = 0;

/// A successfully received RFSM reply.
#[derive(Clone, Debug)]
pub struct Reply {
    pub state: u16,
    pub response_id: Vec<u8>,
    pub response_data: Vec<u8>,
}

/// Callback invoked with the outcome of one request.
pub type ResponseHandler = Box<dyn FnOnce(&Reactor, Result<Reply>) -> Result<()>>;

struct MasterInner {
    context: zmq::Context,
    endpoint: String,
    socket: Rc<zmq::Socket>,
    busy: bool,
    timer: Option<TimerId>,
    handler: Option<ResponseHandler>,
}

/// The requesting side of the RFSM protocol.
///
/// The reactor handle is deliberately kept out of the shared inner state:
/// the reactor's handler list keeps the inner state alive, and a reactor
/// handle in there would close an `Rc` cycle.
pub struct Master {
    reactor: Reactor,
    inner: Rc<RefCell<MasterInner>>,
}

impl Master {
    /// Connects to the slave at `endpoint` and registers with the reactor
    /// to be notified of replies.
    pub fn new(reactor: &Reactor, context: &zmq::Context, endpoint: &str) -> Result<Self> {
        let socket = Rc::new(Self::connect(context, endpoint)?);
        let inner = Rc::new(RefCell::new(MasterInner {
            context: context.clone(),
            endpoint: endpoint.to_string(),
            socket: Rc::clone(&socket),
            busy: false,
            timer: None,
            handler: None,
        }));
        Self::register(&inner, reactor, socket);
        Ok(Self {
            reactor: reactor.clone(),
            inner,
        })
    }

    /// Sends one event and arranges for `on_complete` to be called with the
    /// reply, or with [`Error::Timeout`] if none arrives within `timeout`.
    ///
    /// Fails with [`Error::Busy`] while a previous request is outstanding.
    pub fn send_event(
        &self,
        event_id: &[u8],
        event_data: &[u8],
        timeout: Duration,
        on_complete: ResponseHandler,
    ) -> Result<()> {
        {
            let mut m = self.inner.borrow_mut();
            if m.busy {
                return Err(Error::Busy);
            }
            m.socket
                .send_multipart([EVENT_FRAME, event_id, event_data], 0)?;
            m.busy = true;
            m.handler = Some(on_complete);
        }
        let inner = Rc::clone(&self.inner);
        let timer = self
            .reactor
            .add_timer(timeout, 1, move |r, _| Self::on_timeout(&inner, r))?;
        self.inner.borrow_mut().timer = Some(timer);
        Ok(())
    }

    fn connect(context: &zmq::Context, endpoint: &str) -> Result<zmq::Socket> {
        let socket = context.socket(zmq::REQ)?;
        socket.set_linger(0)?;
        socket.connect(endpoint)?;
        Ok(socket)
    }

    fn register(inner: &Rc<RefCell<MasterInner>>, reactor: &Reactor, socket: Rc<zmq::Socket>) {
        let inner = Rc::clone(inner);
        reactor.add_socket(socket, move |r, _| Self::receive_reply(&inner, r));
    }

    fn receive_reply(inner: &Rc<RefCell<MasterInner>>, reactor: &Reactor) -> Result<()> {
        let socket = Rc::clone(&inner.borrow().socket);
        let received = socket.recv_multipart(0);
        let (timer, handler) = {
            let mut m = inner.borrow_mut();
            m.busy = false;
            (m.timer.take(), m.handler.take())
        };
        if let Some(timer) = timer {
            let _ = reactor.remove_timer(timer);
        }
        let Some(handler) = handler else {
            tracing::warn!("discarding unsolicited RFSM reply");
            return Ok(());
        };
        let outcome = match received {
            Ok(frames) => Self::parse_reply(frames),
            Err(e) => {
                tracing::debug!(error = %e, "RFSM reply socket failed");
                Err(Error::ConnectionClosed)
            }
        };
        match outcome {
            Ok(reply) => handler(reactor, Ok(reply)),
            Err(e) => {
                // Both a dead socket and a malformed reply taint the
                // REQ/REP lockstep.
                Self::rebuild_socket(inner, reactor)?;
                handler(reactor, Err(e))
            }
        }
    }

    fn parse_reply(frames: Vec<Vec<u8>>) -> Result<Reply> {
        if frames.len() != 3 {
            return Err(Error::Protocol(format!(
                "expected 3 reply frames, got {}",
                frames.len()
            )));
        }
        let mut frames = frames.into_iter();
        let state_frame = frames.next().unwrap_or_default();
        if state_frame.len() != 2 {
            return Err(Error::Protocol("malformed state tag frame".into()));
        }
        let state = u16::from_le_bytes([state_frame[0], state_frame[1]]);
        Ok(Reply {
            state,
            response_id: frames.next().unwrap_or_default(),
            response_data: frames.next().unwrap_or_default(),
        })
    }

    fn on_timeout(inner: &Rc<RefCell<MasterInner>>, reactor: &Reactor) -> Result<()> {
        let handler = {
            let mut m = inner.borrow_mut();
            m.busy = false;
            m.timer = None;
            m.handler.take()
        };
        tracing::debug!("RFSM request timed out, rebuilding request socket");
        Self::rebuild_socket(inner, reactor)?;
        match handler {
            Some(handler) => handler(reactor, Err(Error::Timeout("no RFSM reply".into()))),
            None => Ok(()),
        }
    }

    /// Tears down the REQ socket and creates a fresh one.  Required after a
    /// timeout or malformed reply, since the REQ/REP lockstep is lost.
    fn rebuild_socket(inner: &Rc<RefCell<MasterInner>>, reactor: &Reactor) -> Result<()> {
        let new_socket = {
            let m = inner.borrow();
            reactor.remove_socket(&m.socket);
            Rc::new(Self::connect(&m.context, &m.endpoint)?)
        };
        inner.borrow_mut().socket = Rc::clone(&new_socket);
        Self::register(inner, reactor, new_socket);
        Ok(())
    }
}

/// Handles events arriving at the slave side of the RFSM protocol.
///
/// Returns the new state tag together with the response ID and data.  An
/// `Err` return becomes a protocol-level error reply and leaves the
/// reported state unchanged.
pub trait SlaveHandler {
    fn handle_event(
        &mut self,
        reactor: &Reactor,
        event_id: &[u8],
        event_data: &[u8],
    ) -> Result<(u16, Vec<u8>, Vec<u8>)>;
}

/// The replying side of the RFSM protocol.
pub struct Slave {
    socket: Rc<zmq::Socket>,
}

impl Slave {
    /// Binds to `endpoint` (wildcard address/port allowed) and dispatches
    /// incoming events to `handler` via the reactor.
    pub fn new(
        reactor: &Reactor,
        context: &zmq::Context,
        endpoint: &str,
        handler: Rc<RefCell<dyn SlaveHandler>>,
    ) -> Result<Self> {
        let socket = context.socket(zmq::REP)?;
        socket.set_linger(0)?;
        socket.bind(endpoint)?;
        let socket = Rc::new(socket);

        let state = Rc::new(RefCell::new(INDETERMINATE_STATE));
        reactor.add_socket(Rc::clone(&socket), move |r, s| {
            Self::serve_one(r, s, &handler, &state)
        });
        Ok(Self { socket })
    }

    /// The endpoint the server is actually bound to.  Wildcard host `*`
    /// resolves to `0.0.0.0`, wildcard port to the ephemeral port the OS
    /// chose.
    pub fn bound_endpoint(&self) -> Result<String> {
        self.socket
            .get_last_endpoint()?
            .map_err(|_| Error::Protocol("bound endpoint is not valid UTF-8".into()))
    }

    fn serve_one(
        reactor: &Reactor,
        socket: &zmq::Socket,
        handler: &Rc<RefCell<dyn SlaveHandler>>,
        state: &Rc<RefCell<u16>>,
    ) -> Result<()> {
        let frames = socket.recv_multipart(0)?;
        let outcome = match Self::parse_request(&frames) {
            Ok((event_id, event_data)) => {
                handler
                    .borrow_mut()
                    .handle_event(reactor, event_id, event_data)
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok((new_state, response_id, response_data)) => {
                *state.borrow_mut() = new_state;
                socket.send_multipart(
                    [
                        new_state.to_le_bytes().to_vec(),
                        response_id,
                        response_data,
                    ],
                    0,
                )?;
                Ok(())
            }
            Err(e) => {
                let current = *state.borrow();
                tracing::warn!(error = %e, "slave handler failed, sending error reply");
                socket.send_multipart(
                    [
                        current.to_le_bytes().to_vec(),
                        crate::wire::response::ERROR.to_vec(),
                        e.to_string().into_bytes(),
                    ],
                    0,
                )?;
                // A broken instance is fatal for the slave; everything else
                // is reported to the master and the slave keeps serving.
                match e {
                    Error::InstanceBroken(_) => Err(e),
                    _ => Ok(()),
                }
            }
        }
    }

    fn parse_request(frames: &[Vec<u8>]) -> Result<(&[u8], &[u8])> {
        if frames.len() != 3 {
            return Err(Error::Protocol(format!(
                "expected 3 request frames, got {}",
                frames.len()
            )));
        }
        if frames[0] != EVENT_FRAME {
            return Err(Error::Protocol("first request frame is not EVENT".into()));
        }
        Ok((&frames[1], &frames[2]))
    }
}
