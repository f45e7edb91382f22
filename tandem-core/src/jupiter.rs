//! Two-party Jupiter synchronisation.
//!
//! Each side keeps a count of the messages it generated and received, plus the
//! queue of its own operations the other side may not have seen yet. The
//! server keeps one [`Jupiter`] per client; a client keeps one per document.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::operation::{OtError, Operation};

/// State vector attached to every Jupiter message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JupiterTimestamp {
    /// Messages generated by the sender before this one.
    pub local: u32,
    /// Messages the sender had received from us when generating this one.
    pub remote: u32,
}

#[derive(Debug, Clone)]
pub struct Jupiter {
    server_side: bool,
    local_count: u32,
    remote_count: u32,
    outgoing: VecDeque<(u32, Operation)>,
}

impl Jupiter {
    pub fn new(server_side: bool) -> Self {
        Self {
            server_side,
            local_count: 0,
            remote_count: 0,
            outgoing: VecDeque::new(),
        }
    }

    pub fn timestamp(&self) -> JupiterTimestamp {
        JupiterTimestamp {
            local: self.local_count,
            remote: self.remote_count,
        }
    }

    /// Record a locally generated operation and stamp it for sending.
    pub fn generate(&mut self, operation: Operation) -> JupiterTimestamp {
        let timestamp = self.timestamp();
        self.outgoing.push_back((self.local_count, operation));
        self.local_count += 1;
        timestamp
    }

    /// Transform an operation received from the other side against every
    /// local operation it had not yet seen.
    ///
    /// Operations from the server win insert ties, so both ends of the link
    /// order concurrent inserts the same way.
    pub fn receive(
        &mut self,
        timestamp: JupiterTimestamp,
        operation: Operation,
    ) -> Result<Operation, OtError> {
        while self
            .outgoing
            .front()
            .is_some_and(|(generated, _)| *generated < timestamp.remote)
        {
            self.outgoing.pop_front();
        }

        if timestamp.local != self.remote_count {
            return Err(OtError::UnexpectedTimestamp {
                expected: self.remote_count,
                actual: timestamp.local,
            });
        }

        let incoming_priority = !self.server_side;
        let mut incoming = operation;
        for (_, pending) in self.outgoing.iter_mut() {
            let transformed_incoming = incoming.transform(pending, incoming_priority);
            *pending = pending.transform(&incoming, !incoming_priority);
            incoming = transformed_incoming;
        }

        self.remote_count += 1;
        Ok(incoming)
    }

    /// Number of local operations not yet acknowledged.
    pub fn pending(&self) -> usize {
        self.outgoing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_exchange() {
        let mut client = Jupiter::new(false);
        let mut server = Jupiter::new(true);

        let op = Operation::insert(0, "a");
        let ts = client.generate(op.clone());
        assert_eq!(ts, JupiterTimestamp { local: 0, remote: 0 });
        assert_eq!(server.receive(ts, op.clone()).unwrap(), op);

        let reply = Operation::insert(1, "b");
        let ts = server.generate(reply.clone());
        assert_eq!(ts, JupiterTimestamp { local: 0, remote: 1 });
        assert_eq!(client.receive(ts, reply.clone()).unwrap(), reply);
        assert_eq!(client.pending(), 0);
    }

    #[test]
    fn test_concurrent_inserts_converge() {
        let mut client = Jupiter::new(false);
        let mut server = Jupiter::new(true);
        let mut client_doc = String::from("abc");
        let mut server_doc = String::from("abc");

        let c_op = Operation::insert(1, "C");
        c_op.apply(&mut client_doc).unwrap();
        let c_ts = client.generate(c_op.clone());

        let s_op = Operation::insert(1, "S");
        s_op.apply(&mut server_doc).unwrap();
        let s_ts = server.generate(s_op.clone());

        server.receive(c_ts, c_op).unwrap().apply(&mut server_doc).unwrap();
        client.receive(s_ts, s_op).unwrap().apply(&mut client_doc).unwrap();

        assert_eq!(client_doc, server_doc);
        assert_eq!(client_doc, "aSCbc");
    }

    #[test]
    fn test_rejects_out_of_order_message() {
        let mut server = Jupiter::new(true);
        let err = server
            .receive(JupiterTimestamp { local: 3, remote: 0 }, Operation::insert(0, "x"))
            .unwrap_err();
        assert_eq!(err, OtError::UnexpectedTimestamp { expected: 0, actual: 3 });
    }
}
