use emvscan::{ApduInterface, TransportError};
use hexplay::HexViewBuilder;
use log::{debug, info, warn};
use pcsc::{Card, Context, Disposition, Error, Protocols, Scope, ShareMode, MAX_ATR_SIZE, MAX_BUFFER_SIZE};

const MAX_READER_SIZE: usize = 2048;

// PC/SC part 3, 3.2.2.1.3 GET DATA pseudo-APDU: card UID
const GET_UID: [u8; 5] = [0xFF, 0xCA, 0x00, 0x00, 0x00];

/// Card on the first PC/SC reader.
pub struct PcscTransport {
    ctx: Context,
    card: Option<Card>,
}

impl PcscTransport {
    pub fn new() -> Result<PcscTransport, TransportError> {
        let ctx = Context::establish(Scope::User)
            .map_err(|err| TransportError::Connect(format!("Failed to establish context: {}", err)))?;

        Ok(PcscTransport { ctx, card: None })
    }
}

impl ApduInterface for PcscTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        let mut readers_buf = [0; MAX_READER_SIZE];
        let mut readers = self
            .ctx
            .list_readers(&mut readers_buf)
            .map_err(|err| TransportError::Connect(format!("Failed to list readers: {}", err)))?;

        let reader = readers
            .next()
            .ok_or_else(|| TransportError::Connect("No readers are connected.".to_string()))?;

        let card = match self.ctx.connect(reader, ShareMode::Shared, Protocols::ANY) {
            Ok(card) => card,
            Err(Error::NoSmartcard) => {
                return Err(TransportError::Connect("No card found in the reader".to_string()))
            }
            Err(err) => {
                return Err(TransportError::Connect(format!(
                    "Could not connect to the card: {}",
                    err
                )))
            }
        };

        let mut names_buffer = [0; MAX_READER_SIZE];
        let mut atr_buffer = [0; MAX_ATR_SIZE];
        match card.status2(&mut names_buffer, &mut atr_buffer) {
            Ok(card_status) => {
                // https://www.eftlab.com/knowledge-base/171-atr-list-full/
                info!("Card reader: {:?}", reader);
                info!("Card ATR:\n{}", HexViewBuilder::new(card_status.atr()).finish());
                info!("Card protocol: {:?}", card_status.protocol2());
            }
            Err(err) => warn!("Could not read card status: {}", err),
        }

        self.card = Some(card);
        Ok(())
    }

    fn transceive(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        let card = self.card.as_ref().ok_or(TransportError::CardRemoved)?;
        let mut apdu_response_buffer = [0; MAX_BUFFER_SIZE];

        match card.transmit(apdu, &mut apdu_response_buffer) {
            Ok(response) => Ok(response.to_vec()),
            Err(Error::RemovedCard) | Err(Error::ResetCard) | Err(Error::NoSmartcard) => {
                Err(TransportError::CardRemoved)
            }
            Err(err) => Err(TransportError::Transmit(err.to_string())),
        }
    }

    fn close(&mut self) {
        if let Some(card) = self.card.take() {
            if let Err((_, err)) = card.disconnect(Disposition::LeaveCard) {
                warn!("Could not disconnect card: {}", err);
            }
        }
    }

    fn card_uid(&mut self) -> Option<Vec<u8>> {
        let response = match self.transceive(&GET_UID) {
            Ok(response) => response,
            Err(err) => {
                debug!("Card UID not available: {}", err);
                return None;
            }
        };

        match response.as_slice() {
            [uid @ .., 0x90, 0x00] if !uid.is_empty() => Some(uid.to_vec()),
            _ => {
                debug!("Reader does not report card UID: {:02X?}", response);
                None
            }
        }
    }
}
