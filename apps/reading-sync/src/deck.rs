use rand::seq::SliceRandom;
use rand::Rng;
use reading_session::{Card, SelectedCard, SessionRecord};
use serde_json::json;

const MAJOR_ARCANA: [&str; 22] = [
    "The Fool",
    "The Magician",
    "The High Priestess",
    "The Empress",
    "The Emperor",
    "The Hierophant",
    "The Lovers",
    "The Chariot",
    "Strength",
    "The Hermit",
    "Wheel of Fortune",
    "Justice",
    "The Hanged Man",
    "Death",
    "Temperance",
    "The Devil",
    "The Tower",
    "The Star",
    "The Moon",
    "The Sun",
    "Judgement",
    "The World",
];

pub fn major_arcana() -> Vec<Card> {
    MAJOR_ARCANA
        .iter()
        .enumerate()
        .map(|(number, name)| {
            let id = name.to_ascii_lowercase().replace(' ', "-");
            let mut card = Card::new(id, *name);
            card.attributes.insert("arcana".into(), json!("major"));
            card.attributes.insert("number".into(), json!(number));
            card
        })
        .collect()
}

pub fn shuffled<R: Rng + ?Sized>(rng: &mut R) -> Vec<Card> {
    let mut deck = major_arcana();
    deck.shuffle(rng);
    deck
}

/// Top of the remaining deck, placed after the cards already drawn.
pub fn next_draw<R: Rng + ?Sized>(record: &SessionRecord, rng: &mut R) -> Option<SelectedCard> {
    let card = record.shuffled_deck.first()?.clone();
    Some(SelectedCard {
        card,
        position: record.selected_cards.len() as u32,
        is_reversed: rng.gen_bool(0.5),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use reading_session::DEFAULT_DECK_ID;

    fn record_with_deck(deck: Vec<Card>) -> SessionRecord {
        let mut record: SessionRecord = serde_json::from_value(json!({
            "id": "s-1",
            "deck_id": DEFAULT_DECK_ID,
            "is_active": true,
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-01T10:00:00Z"
        }))
        .expect("record");
        record.shuffled_deck = deck;
        record
    }

    #[test]
    fn shuffle_keeps_every_card_once() {
        let mut deck = shuffled(&mut rand::thread_rng());
        assert_eq!(deck.len(), 22);
        deck.sort_by(|a, b| a.id.cmp(&b.id));
        deck.dedup_by(|a, b| a.id == b.id);
        assert_eq!(deck.len(), 22);
        assert!(major_arcana().iter().any(|c| c.id == "wheel-of-fortune"));
    }

    #[test]
    fn draws_from_the_top_after_existing_cards() {
        let mut rng = StepRng::new(0, 0);
        let mut record = record_with_deck(major_arcana());
        let first = next_draw(&record, &mut rng).expect("card");
        assert_eq!(first.card.id, "the-fool");
        assert_eq!(first.position, 0);

        record.selected_cards.push(first);
        record.shuffled_deck.remove(0);
        let second = next_draw(&record, &mut rng).expect("card");
        assert_eq!(second.card.id, "the-magician");
        assert_eq!(second.position, 1);

        record.shuffled_deck.clear();
        assert!(next_draw(&record, &mut rng).is_none());
    }
}
