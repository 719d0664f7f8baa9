use crate::{Action, Connection, Error, Handler, Packet};

/// Writes every received packet back to its sender.
///
/// Received blocks are queued for sending as is, so echoing never copies payload bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Echo;

impl Handler for Echo {
    fn on_packet(&mut self, conn: &mut Connection, packet: Packet) -> Result<Action, Error> {
        conn.queue(packet)?;
        Ok(Action::Continue)
    }
}
